//! Load-command editing across every slice of an executable.

use super::parser::{MachOFile, SliceLayout};
use super::signer::{Signer, SigningIdentity};
use super::writer::{assemble_fat, write_atomic, write_u32_le};
use super::{
    align_to, LoadReference, PatchError, DYLIB_COMMAND_SIZE, LC_LOAD_DYLIB,
    LINKEDIT_DATA_COMMAND_SIZE,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const HEADER_NCMDS_OFFSET: usize = 16;
const HEADER_SIZEOFCMDS_OFFSET: usize = 20;

/// Timestamp and versions written into injected dylib commands.
const DYLIB_TIMESTAMP: u32 = 2;
const DYLIB_VERSION: u32 = 0x10000;

/// Adds and removes `LC_LOAD_DYLIB` references, re-signs, and replaces the
/// executable atomically.
pub struct MachOPatcher {
    signer: Arc<dyn Signer>,
    identity: SigningIdentity,
}

/// Result of a successful [`MachOPatcher::apply`].
#[derive(Debug)]
pub struct AppliedPatch {
    path: PathBuf,
    original: Vec<u8>,
    changed: bool,
}

impl AppliedPatch {
    /// `true` when no slice needed editing and the file was left alone.
    pub fn is_noop(&self) -> bool {
        !self.changed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically put the original bytes back.
    pub fn revert(&self) -> Result<(), PatchError> {
        if self.changed {
            write_atomic(&self.path, &self.original)?;
            info!(path = %self.path.display(), "Reverted executable");
        }
        Ok(())
    }
}

impl MachOPatcher {
    pub fn new(signer: Arc<dyn Signer>, identity: SigningIdentity) -> Self {
        Self { signer, identity }
    }

    /// Apply `removals` then `additions` to every slice of `executable`.
    ///
    /// Any failure leaves the file untouched. When nothing changes, nothing
    /// is written.
    pub fn apply(
        &self,
        executable: &Path,
        additions: &[LoadReference],
        removals: &[LoadReference],
    ) -> Result<AppliedPatch, PatchError> {
        let original = fs::read(executable)?;
        let file = MachOFile::parse(original.clone())?;

        let mut changed = false;
        let mut slices = Vec::with_capacity(file.slices().len());
        for slice in file.slices() {
            let bytes = file.slice_bytes(slice).to_vec();
            let (bytes, slice_changed) = self.patch_slice(bytes, additions, removals)?;
            changed |= slice_changed;
            slices.push(bytes);
        }

        if changed {
            let output = if file.is_fat() {
                assemble_fat(file.slices(), &slices)?
            } else {
                slices.swap_remove(0)
            };
            write_atomic(executable, &output)?;
            info!(
                path = %executable.display(),
                added = additions.len(),
                removed = removals.len(),
                "Patched executable"
            );
        } else {
            debug!(path = %executable.display(), "Load commands already up to date");
        }

        Ok(AppliedPatch {
            path: executable.to_path_buf(),
            original,
            changed,
        })
    }

    fn patch_slice(
        &self,
        mut bytes: Vec<u8>,
        additions: &[LoadReference],
        removals: &[LoadReference],
    ) -> Result<(Vec<u8>, bool), PatchError> {
        let mut layout = SliceLayout::parse(&bytes)?;
        if layout.encrypted {
            return Err(PatchError::Encrypted { arch: layout.arch });
        }

        let mut changed = false;

        for reference in removals {
            while let Some(entry) = layout.find_dylib(reference.path()) {
                let (offset, cmdsize) = (entry.offset, entry.cmdsize);
                remove_command(&mut bytes, &layout, offset, cmdsize);
                debug!(arch = %layout.arch, reference = %reference, "Removed load command");
                layout = SliceLayout::parse(&bytes)?;
                changed = true;
            }
        }

        for reference in additions {
            if layout.find_dylib(reference.path()).is_some() {
                continue;
            }
            insert_dylib_command(&mut bytes, &layout, reference.path())?;
            debug!(arch = %layout.arch, reference = %reference, "Added load command");
            layout = SliceLayout::parse(&bytes)?;
            changed = true;
        }

        if !changed {
            return Ok((bytes, false));
        }

        let signed = self
            .signer
            .sign_slice(&bytes, &self.identity)
            .map_err(|source| PatchError::Signing {
                arch: layout.arch.clone(),
                source,
            })?;
        Ok((signed, true))
    }

    /// Every dylib reference of the first slice, in load order.
    pub fn load_references(&self, executable: &Path) -> Result<Vec<LoadReference>, PatchError> {
        let file = MachOFile::parse(fs::read(executable)?)?;
        let first = file
            .slices()
            .first()
            .ok_or_else(|| PatchError::MachOCorrupt("no slices".into()))?;
        let layout = SliceLayout::parse(file.slice_bytes(first))?;
        Ok(layout
            .dylibs
            .into_iter()
            .map(|d| LoadReference::new(d.name))
            .collect())
    }
}

fn insert_dylib_command(
    bytes: &mut [u8],
    layout: &SliceLayout,
    path: &str,
) -> Result<(), PatchError> {
    let cmdsize = align_to(DYLIB_COMMAND_SIZE + path.len() + 1, 8);
    // Unsigned slices still need room for LC_CODE_SIGNATURE afterwards
    let reserve = if layout.code_signature.is_none() {
        LINKEDIT_DATA_COMMAND_SIZE
    } else {
        0
    };
    let available = layout.header_padding();
    if cmdsize + reserve > available {
        return Err(PatchError::InsufficientHeaderPadding {
            arch: layout.arch.clone(),
            needed: cmdsize + reserve,
            available,
        });
    }

    let at = layout.load_commands_end();
    let cmd = &mut bytes[at..at + cmdsize];
    cmd.fill(0);
    write_u32_le(cmd, 0, LC_LOAD_DYLIB);
    write_u32_le(cmd, 4, cmdsize as u32);
    write_u32_le(cmd, 8, DYLIB_COMMAND_SIZE as u32);
    write_u32_le(cmd, 12, DYLIB_TIMESTAMP);
    write_u32_le(cmd, 16, DYLIB_VERSION);
    write_u32_le(cmd, 20, DYLIB_VERSION);
    cmd[DYLIB_COMMAND_SIZE..DYLIB_COMMAND_SIZE + path.len()].copy_from_slice(path.as_bytes());

    write_u32_le(bytes, HEADER_NCMDS_OFFSET, layout.ncmds + 1);
    write_u32_le(
        bytes,
        HEADER_SIZEOFCMDS_OFFSET,
        layout.sizeofcmds + cmdsize as u32,
    );
    Ok(())
}

fn remove_command(bytes: &mut [u8], layout: &SliceLayout, offset: usize, cmdsize: usize) {
    let end = layout.load_commands_end();
    bytes.copy_within(offset + cmdsize..end, offset);
    bytes[end - cmdsize..end].fill(0);

    write_u32_le(bytes, HEADER_NCMDS_OFFSET, layout.ncmds - 1);
    write_u32_le(
        bytes,
        HEADER_SIZEOFCMDS_OFFSET,
        layout.sizeofcmds - cmdsize as u32,
    );
}
