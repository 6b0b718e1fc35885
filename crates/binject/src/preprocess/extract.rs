//! Zip extraction into a staging directory.

use crate::error::IoResultExt;
use crate::Result;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

struct ExtractEntry {
    index: usize,
    outpath: PathBuf,
    is_symlink: bool,
    #[cfg(unix)]
    unix_mode: Option<u32>,
}

/// Extract every entry of `archive_path` below `dest_dir`.
///
/// The archive is memory-mapped and files are written in parallel, each
/// worker with its own reader over the map. Unix modes and symlinks are
/// restored. Entries whose names escape `dest_dir` are skipped.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).at("open", archive_path)?;
    // SAFETY: the map is read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file) }.at("map", archive_path)?;
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;

    fs::create_dir_all(dest_dir).at("create", dest_dir)?;

    let mut entries = Vec::with_capacity(archive.len());
    let mut dirs = Vec::new();

    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        let Some(name) = file.enclosed_name() else {
            continue;
        };
        let outpath = dest_dir.join(name);

        #[cfg(unix)]
        let unix_mode = file.unix_mode();
        #[cfg(unix)]
        let is_symlink = unix_mode.is_some_and(|mode| (mode & 0o170000) == 0o120000);
        #[cfg(not(unix))]
        let is_symlink = false;

        if file.is_dir() {
            dirs.push(outpath);
            continue;
        }
        if let Some(parent) = outpath.parent() {
            if !dirs.iter().any(|d| d == parent) {
                dirs.push(parent.to_path_buf());
            }
        }
        entries.push(ExtractEntry {
            index,
            outpath,
            is_symlink,
            #[cfg(unix)]
            unix_mode,
        });
    }

    for dir in &dirs {
        fs::create_dir_all(dir).at("create", dir)?;
    }

    entries.par_iter().try_for_each(|entry| -> Result<()> {
        let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;
        let mut file = archive.by_index(entry.index)?;

        #[cfg(unix)]
        if entry.is_symlink {
            let mut target = String::new();
            file.read_to_string(&mut target)
                .at("read link target", &entry.outpath)?;
            if entry.outpath.symlink_metadata().is_ok() {
                fs::remove_file(&entry.outpath).at("replace", &entry.outpath)?;
            }
            std::os::unix::fs::symlink(&target, &entry.outpath)
                .at("create symlink", &entry.outpath)?;
            return Ok(());
        }
        #[cfg(not(unix))]
        let _ = entry.is_symlink;

        let mut outfile = File::create(&entry.outpath).at("create", &entry.outpath)?;
        io::copy(&mut file, &mut outfile).at("write", &entry.outpath)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry.outpath, fs::Permissions::from_mode(mode & 0o7777))
                .at("set permissions on", &entry.outpath)?;
        }

        Ok(())
    })?;

    Ok(())
}
