//! Output side of patching: in-place field writes, universal binary
//! reassembly, and the atomic replace of the executable on disk.

use super::parser::ArchSlice;
use super::{align_to, PatchError};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

/// Rebuild a universal binary from `slices`, in the order of `arches`.
///
/// A slice keeps its original offset when it still fits after the
/// previous one; otherwise it moves to the next offset aligned to its
/// `align`. CPU type, subtype (including capability bits) and alignment
/// are copied unchanged.
pub fn assemble_fat(arches: &[ArchSlice], slices: &[Vec<u8>]) -> Result<Vec<u8>, PatchError> {
    if arches.len() != slices.len() || arches.is_empty() {
        return Err(PatchError::MachOCorrupt(
            "slice count does not match fat table".into(),
        ));
    }

    let mut cursor = FAT_HEADER_SIZE + arches.len() * FAT_ARCH_SIZE;
    let mut offsets = Vec::with_capacity(arches.len());
    for (arch, data) in arches.iter().zip(slices) {
        let alignment = 1usize << arch.align.min(31);
        let offset = arch.offset.max(align_to(cursor, alignment));
        offsets.push(offset);
        cursor = offset + data.len();
    }

    if cursor > u32::MAX as usize {
        return Err(PatchError::MachOCorrupt(
            "universal binary exceeds 4 GiB".into(),
        ));
    }

    let mut output = vec![0u8; cursor];
    write_u32_be(&mut output, 0, FAT_MAGIC);
    write_u32_be(&mut output, 4, arches.len() as u32);

    for (i, (arch, data)) in arches.iter().zip(slices).enumerate() {
        let entry = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
        write_u32_be(&mut output, entry, arch.cputype);
        write_u32_be(&mut output, entry + 4, arch.cpusubtype);
        write_u32_be(&mut output, entry + 8, offsets[i] as u32);
        write_u32_be(&mut output, entry + 12, data.len() as u32);
        write_u32_be(&mut output, entry + 16, arch.align);
        output[offsets[i]..offsets[i] + data.len()].copy_from_slice(data);
    }

    Ok(output)
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory. The original permissions are kept.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = tempfile::Builder::new()
        .prefix(".binject-")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    if let Some(permissions) = permissions {
        fs::set_permissions(tmp.path(), permissions)?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn write_u32_be(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64_le(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
