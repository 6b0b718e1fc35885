//! Copying, removing and journaled placement of plug-in files.

use crate::error::IoResultExt;
use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Copy a file, symlink or directory tree from `src` to `dst`.
///
/// Symlinks are recreated rather than followed and permissions are kept.
/// Parent directories of `dst` are created as needed.
pub fn copy_item(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).at("inspect", src)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).at("create", parent)?;
    }

    if !meta.is_dir() {
        return copy_leaf(src, dst, meta.file_type().is_symlink());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from).at("walk", src)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).at("create", &target)?;
        } else {
            copy_leaf(entry.path(), &target, file_type.is_symlink())?;
        }
    }

    Ok(())
}

fn copy_leaf(src: &Path, dst: &Path, is_symlink: bool) -> Result<()> {
    if is_symlink {
        let link = fs::read_link(src).at("read link", src)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link, dst).at("create symlink", dst)?;
        #[cfg(not(unix))]
        {
            let resolved = src.parent().map(|p| p.join(&link)).unwrap_or(link);
            fs::copy(&resolved, dst).at("copy", &resolved)?;
        }
    } else {
        fs::copy(src, dst).at("copy", src)?;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree.
pub fn remove_item(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[derive(Debug)]
struct Placement {
    dest: PathBuf,
    displaced: Option<PathBuf>,
}

/// Record of files placed into a bundle during one transaction.
///
/// A destination that already exists is renamed aside to
/// `.<name>.binject-displaced` before the new item is copied in.
/// [`rollback`](Self::rollback) removes the placed items and moves the
/// displaced ones back; [`commit`](Self::commit) deletes the displaced
/// ones. Dropping an unfinished journal rolls back.
#[derive(Debug, Default)]
pub struct FileJournal {
    placements: Vec<Placement>,
    finished: bool,
}

impl FileJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `src` to `dest`, moving an existing `dest` aside first.
    pub fn place(&mut self, src: &Path, dest: &Path) -> Result<()> {
        let displaced = if exists(dest) {
            let aside = displaced_path(dest);
            if exists(&aside) {
                remove_item(&aside).at("remove", &aside)?;
            }
            fs::rename(dest, &aside).at("move aside", dest)?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = copy_item(src, dest) {
            if exists(dest) {
                if let Err(cleanup) = remove_item(dest) {
                    warn!(path = %dest.display(), error = %cleanup, "Failed to remove partial copy");
                }
            }
            if let Some(aside) = &displaced {
                if let Err(restore) = fs::rename(aside, dest) {
                    warn!(path = %dest.display(), error = %restore, "Failed to restore displaced item");
                }
            }
            return Err(e);
        }

        debug!(src = %src.display(), dest = %dest.display(), "Placed item");
        self.placements.push(Placement {
            dest: dest.to_path_buf(),
            displaced,
        });
        Ok(())
    }

    /// Destinations placed so far, in order.
    pub fn placed(&self) -> impl Iterator<Item = &Path> {
        self.placements.iter().map(|p| p.dest.as_path())
    }

    /// Keep the placed items and delete whatever they replaced.
    pub fn commit(mut self) {
        self.finished = true;
        for placement in &self.placements {
            if let Some(aside) = &placement.displaced {
                if let Err(e) = remove_item(aside) {
                    warn!(path = %aside.display(), error = %e, "Failed to delete displaced item");
                }
            }
        }
    }

    /// Undo every placement, newest first.
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        self.finished = true;
        for placement in self.placements.drain(..).rev() {
            if exists(&placement.dest) {
                if let Err(e) = remove_item(&placement.dest) {
                    warn!(path = %placement.dest.display(), error = %e, "Failed to remove placed item");
                    continue;
                }
            }
            if let Some(aside) = placement.displaced {
                if let Err(e) = fs::rename(&aside, &placement.dest) {
                    warn!(path = %aside.display(), error = %e, "Failed to restore displaced item");
                }
            }
        }
    }
}

impl Drop for FileJournal {
    fn drop(&mut self) {
        if !self.finished {
            self.undo();
        }
    }
}

fn displaced_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.binject-displaced"))
}
