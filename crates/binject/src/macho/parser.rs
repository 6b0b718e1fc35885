//! Mach-O file parsing using goblin.
//!
//! [`MachOFile`] splits a thin or universal binary into architecture
//! slices. [`SliceLayout`] is the view of one slice that the patcher and
//! the signer work from: where the load commands end, where the first
//! section begins, and the file offsets of every command they edit.

use super::{PatchError, LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, MACH_HEADER_64_SIZE};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};

const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_X86: u32 = 7;
const CPU_SUBTYPE_ARM64E: u32 = 2;
/// Capability bits (arm64e pointer-authentication ABI) live in the top byte.
const CPU_SUBTYPE_MASK: u32 = 0x00ff_ffff;

/// Size of a segment_command_64 without its sections
const SEGMENT_COMMAND_64_SIZE: usize = 72;
/// Size of a section_64
const SECTION_64_SIZE: usize = 80;

/// A parsed thin or universal Mach-O file.
pub struct MachOFile {
    data: Vec<u8>,
    is_fat: bool,
    slices: Vec<ArchSlice>,
}

/// One architecture slice of a [`MachOFile`].
#[derive(Debug, Clone)]
pub struct ArchSlice {
    /// Offset in file
    pub offset: usize,
    pub size: usize,
    pub cputype: u32,
    /// CPU subtype including capability bits.
    pub cpusubtype: u32,
    /// Power-of-two alignment from the fat table (0 for thin files).
    pub align: u32,
}

impl ArchSlice {
    pub fn arch_name(&self) -> String {
        arch_name(self.cputype, self.cpusubtype)
    }
}

impl MachOFile {
    /// Split `data` into slices. Slices are validated separately by
    /// [`SliceLayout::parse`].
    pub fn parse(data: Vec<u8>) -> Result<Self, PatchError> {
        let mach = Mach::parse(&data).map_err(|e| PatchError::MachOCorrupt(e.to_string()))?;

        let (is_fat, slices) = match mach {
            Mach::Binary(macho) => {
                let slice = ArchSlice {
                    offset: 0,
                    size: data.len(),
                    cputype: macho.header.cputype,
                    cpusubtype: macho.header.cpusubtype,
                    align: 0,
                };
                (false, vec![slice])
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for (i, arch) in fat.iter_arches().enumerate() {
                    let arch = arch
                        .map_err(|e| PatchError::MachOCorrupt(format!("fat arch {i}: {e}")))?;
                    let offset = arch.offset as usize;
                    let size = arch.size as usize;
                    if offset.checked_add(size).map_or(true, |end| end > data.len()) {
                        return Err(PatchError::MachOCorrupt(format!(
                            "fat arch {i} extends past end of file"
                        )));
                    }
                    slices.push(ArchSlice {
                        offset,
                        size,
                        cputype: arch.cputype,
                        cpusubtype: arch.cpusubtype,
                        align: arch.align,
                    });
                }
                if slices.is_empty() {
                    return Err(PatchError::MachOCorrupt("empty fat binary".into()));
                }
                (true, slices)
            }
        };

        Ok(Self {
            data,
            is_fat,
            slices,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    pub fn slice_bytes(&self, slice: &ArchSlice) -> &[u8] {
        &self.data[slice.offset..slice.offset + slice.size]
    }
}

/// A dylib load command inside a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibEntry {
    /// Offset of the command in the slice
    pub offset: usize,
    pub cmdsize: usize,
    pub cmd: u32,
    pub name: String,
}

/// `LC_CODE_SIGNATURE` location and payload range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSignatureEntry {
    pub offset: usize,
    pub dataoff: u32,
    pub datasize: u32,
}

/// `__LINKEDIT` segment command location and extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditEntry {
    pub offset: usize,
    pub fileoff: u64,
    pub filesize: u64,
    pub vmsize: u64,
}

/// Structural facts about one 64-bit little-endian slice.
#[derive(Debug, Clone)]
pub struct SliceLayout {
    pub arch: String,
    pub is_executable: bool,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    /// Smallest non-zero section or segment file offset. Load commands
    /// may grow up to here.
    pub first_content_offset: usize,
    pub dylibs: Vec<DylibEntry>,
    pub code_signature: Option<CodeSignatureEntry>,
    pub linkedit: Option<LinkeditEntry>,
    pub text_filesize: Option<u64>,
    pub encrypted: bool,
}

impl SliceLayout {
    pub fn parse(bytes: &[u8]) -> Result<Self, PatchError> {
        let magic = read_u32_le(bytes, 0)
            .ok_or_else(|| PatchError::MachOCorrupt("truncated header".into()))?;
        let cputype = read_u32_le(bytes, 4).unwrap_or(0);
        let cpusubtype = read_u32_le(bytes, 8).unwrap_or(0);

        match magic {
            MH_MAGIC_64 => {}
            MH_MAGIC => {
                return Err(PatchError::UnsupportedArchitecture {
                    arch: arch_name(cputype, cpusubtype),
                })
            }
            MH_CIGAM | MH_CIGAM_64 => {
                return Err(PatchError::UnsupportedArchitecture {
                    arch: format!(
                        "big-endian {}",
                        arch_name(cputype.swap_bytes(), cpusubtype.swap_bytes())
                    ),
                })
            }
            other => {
                return Err(PatchError::MachOCorrupt(format!(
                    "bad magic {other:#010x}"
                )))
            }
        }

        let arch = arch_name(cputype, cpusubtype);
        if !is_supported(cputype, cpusubtype) {
            return Err(PatchError::UnsupportedArchitecture { arch });
        }

        let macho = MachO::parse(bytes, 0)
            .map_err(|e| PatchError::MachOCorrupt(format!("{arch}: {e}")))?;

        Self::from_macho(bytes, &macho, arch)
    }

    fn from_macho(bytes: &[u8], macho: &MachO, arch: String) -> Result<Self, PatchError> {
        let corrupt = |what: &str| PatchError::MachOCorrupt(format!("{arch}: {what}"));

        let mut first_content_offset = usize::MAX;
        let mut dylibs = Vec::new();
        let mut code_signature = None;
        let mut linkedit = None;
        let mut text_filesize = None;
        let mut encrypted = false;

        for lc in &macho.load_commands {
            match &lc.command {
                CommandVariant::LoadDylib(dy) | CommandVariant::LoadWeakDylib(dy) => {
                    let cmdsize = dy.cmdsize as usize;
                    let name_start = lc.offset + dy.dylib.name as usize;
                    let cmd_end = lc.offset + cmdsize;
                    let raw = bytes
                        .get(name_start..cmd_end)
                        .ok_or_else(|| corrupt("dylib name out of bounds"))?;
                    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    dylibs.push(DylibEntry {
                        offset: lc.offset,
                        cmdsize,
                        cmd: dy.cmd,
                        name: String::from_utf8_lossy(&raw[..len]).into_owned(),
                    });
                }
                CommandVariant::CodeSignature(cs) => {
                    code_signature = Some(CodeSignatureEntry {
                        offset: lc.offset,
                        dataoff: cs.dataoff,
                        datasize: cs.datasize,
                    });
                }
                CommandVariant::EncryptionInfo64(enc) => {
                    encrypted |= enc.cryptid != 0;
                }
                CommandVariant::Segment64(seg) => {
                    let name = segment_name(&seg.segname);
                    if name == "__TEXT" {
                        text_filesize = Some(seg.filesize);
                    } else if name == "__LINKEDIT" {
                        linkedit = Some(LinkeditEntry {
                            offset: lc.offset,
                            fileoff: seg.fileoff,
                            filesize: seg.filesize,
                            vmsize: seg.vmsize,
                        });
                    }
                    if seg.fileoff > 0 && seg.filesize > 0 {
                        first_content_offset = first_content_offset.min(seg.fileoff as usize);
                    }
                    for i in 0..seg.nsects as usize {
                        let section = lc.offset + SEGMENT_COMMAND_64_SIZE + i * SECTION_64_SIZE;
                        let offset = read_u32_le(bytes, section + 48)
                            .ok_or_else(|| corrupt("section header out of bounds"))?;
                        if offset > 0 {
                            first_content_offset = first_content_offset.min(offset as usize);
                        }
                    }
                }
                _ => {}
            }
        }

        if first_content_offset == usize::MAX {
            first_content_offset = bytes.len();
        }

        Ok(Self {
            arch,
            is_executable: macho.header.filetype == MH_EXECUTE,
            ncmds: macho.header.ncmds as u32,
            sizeofcmds: macho.header.sizeofcmds,
            first_content_offset,
            dylibs,
            code_signature,
            linkedit,
            text_filesize,
            encrypted,
        })
    }

    /// File offset just past the last load command.
    pub fn load_commands_end(&self) -> usize {
        MACH_HEADER_64_SIZE + self.sizeofcmds as usize
    }

    /// Free bytes between the load commands and the first section.
    pub fn header_padding(&self) -> usize {
        self.first_content_offset
            .saturating_sub(self.load_commands_end())
    }

    pub fn find_dylib(&self, path: &str) -> Option<&DylibEntry> {
        self.dylibs.iter().find(|d| {
            (d.cmd == LC_LOAD_DYLIB || d.cmd == LC_LOAD_WEAK_DYLIB) && d.name == path
        })
    }
}

fn segment_name(raw: &[u8; 16]) -> &str {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len]).unwrap_or("")
}

fn is_supported(cputype: u32, cpusubtype: u32) -> bool {
    match cputype {
        CPU_TYPE_X86_64 => true,
        CPU_TYPE_ARM64 => matches!(cpusubtype & CPU_SUBTYPE_MASK, 0 | 1 | CPU_SUBTYPE_ARM64E),
        _ => false,
    }
}

/// Human-readable architecture name.
pub fn arch_name(cputype: u32, cpusubtype: u32) -> String {
    match (cputype, cpusubtype & CPU_SUBTYPE_MASK) {
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => "arm64e".into(),
        (CPU_TYPE_ARM64, _) => "arm64".into(),
        (CPU_TYPE_X86_64, _) => "x86_64".into(),
        (CPU_TYPE_ARM, 9) => "armv7".into(),
        (CPU_TYPE_ARM, 11) => "armv7s".into(),
        (CPU_TYPE_ARM, _) => "arm".into(),
        (CPU_TYPE_X86, _) => "i386".into(),
        (other, sub) => format!("cpu {other:#x}/{sub:#x}"),
    }
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}
