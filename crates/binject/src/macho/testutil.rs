//! Synthetic Mach-O images for unit tests.

use super::align_to;

const TEXT_VMADDR: u64 = 0x1_0000_0000;

pub struct SliceTemplate {
    pub x86_64: bool,
    /// Overrides the CPU type and subtype.
    pub cputype: Option<(u32, u32)>,
    /// File offset of `__text`; bounds the header padding.
    pub text_offset: u32,
    pub encrypted: bool,
    pub dylibs: Vec<String>,
}

impl Default for SliceTemplate {
    fn default() -> Self {
        Self {
            x86_64: false,
            cputype: None,
            text_offset: 0x3000,
            encrypted: false,
            dylibs: vec!["/usr/lib/libSystem.B.dylib".into()],
        }
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn u32s(buf: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        buf.extend(v.to_le_bytes());
    }
}

fn u64s(buf: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        buf.extend(v.to_le_bytes());
    }
}

/// Build an unsigned MH_EXECUTE with `__TEXT` (0..0x4000), `__LINKEDIT`
/// (0x4000..0x4100) and the requested dylib commands.
pub fn thin_executable(template: &SliceTemplate) -> Vec<u8> {
    let mut cmds = Vec::new();
    let mut ncmds = 0u32;

    // __TEXT with one __text section
    u32s(&mut cmds, &[0x19, 72 + 80]);
    cmds.extend(name16("__TEXT"));
    u64s(&mut cmds, &[TEXT_VMADDR, 0x4000, 0, 0x4000]);
    u32s(&mut cmds, &[5, 5, 1, 0]);
    cmds.extend(name16("__text"));
    cmds.extend(name16("__TEXT"));
    u64s(&mut cmds, &[TEXT_VMADDR + template.text_offset as u64, 0x20]);
    u32s(&mut cmds, &[template.text_offset, 2, 0, 0, 0x8000_0400, 0, 0, 0]);
    ncmds += 1;

    // __LINKEDIT
    u32s(&mut cmds, &[0x19, 72]);
    cmds.extend(name16("__LINKEDIT"));
    u64s(&mut cmds, &[TEXT_VMADDR + 0x4000, 0x4000, 0x4000, 0x100]);
    u32s(&mut cmds, &[1, 1, 0, 0]);
    ncmds += 1;

    if template.encrypted {
        u32s(&mut cmds, &[0x2c, 24, template.text_offset, 0x20, 1, 0]);
        ncmds += 1;
    }

    for name in &template.dylibs {
        let cmdsize = align_to(24 + name.len() + 1, 8);
        u32s(&mut cmds, &[0xc, cmdsize as u32, 24, 2, 0x10000, 0x10000]);
        cmds.extend(name.as_bytes());
        cmds.resize(cmds.len() + cmdsize - 24 - name.len(), 0);
        ncmds += 1;
    }

    let (cputype, cpusubtype) = match template.cputype {
        Some(pair) => pair,
        None if template.x86_64 => (0x0100_0007, 3),
        None => (0x0100_000c, 0),
    };

    let mut out = Vec::with_capacity(0x4100);
    u32s(
        &mut out,
        &[0xfeed_facf, cputype, cpusubtype, 2, ncmds, cmds.len() as u32, 0x0020_0085, 0],
    );
    out.extend(cmds);
    assert!(out.len() <= template.text_offset as usize, "fixture header too large");

    out.resize(template.text_offset as usize, 0);
    out.resize(0x4000, 0xd5);
    out.resize(0x4100, 0xaa);
    out
}

/// Wrap slices in a fat header with 2^14 alignment.
pub fn fat_binary(templates: &[SliceTemplate]) -> Vec<u8> {
    let slices: Vec<Vec<u8>> = templates.iter().map(thin_executable).collect();
    let mut header = Vec::new();
    header.extend(0xcafe_babeu32.to_be_bytes());
    header.extend((slices.len() as u32).to_be_bytes());

    let mut offset = 0x4000usize;
    let mut placed = Vec::new();
    for (template, slice) in templates.iter().zip(&slices) {
        let (cputype, cpusubtype) = match template.cputype {
            Some(pair) => pair,
            None if template.x86_64 => (0x0100_0007, 3),
            None => (0x0100_000c, 0),
        };
        for v in [cputype, cpusubtype, offset as u32, slice.len() as u32, 14] {
            header.extend(v.to_be_bytes());
        }
        placed.push(offset);
        offset = align_to(offset + slice.len(), 0x4000);
    }

    let mut out = header;
    for (slice, at) in slices.iter().zip(placed) {
        out.resize(at, 0);
        out.extend(slice);
    }
    out
}
