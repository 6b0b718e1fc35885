//! Plug-in backups.
//!
//! Before every injection the currently injected plug-ins of an app are
//! archived to `<AppName>Plugins_<MMdd-HHmmss>.zip` in the backups
//! directory. Only the newest archive per app is kept. Restoring feeds the
//! newest archive back into an injection.

use crate::error::IoResultExt;
use crate::{Error, Result};
use chrono::Local;
use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A backup archive written by [`BackupManager::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub path: PathBuf,
    /// Number of plug-ins archived, `None` when an input archive was
    /// copied verbatim.
    pub assets: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(backups_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: backups_dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive `assets` for `app_name`, replacing older archives of the app.
    ///
    /// When `reuse` is given (the injection input is a single zip) it is
    /// copied verbatim instead and is never deleted by the pruning.
    pub fn snapshot(
        &self,
        app_name: &str,
        assets: &[PathBuf],
        reuse: Option<&Path>,
    ) -> Result<BackupSnapshot> {
        fs::create_dir_all(&self.dir).at("create", &self.dir)?;

        let file_name = format!(
            "{}{}.zip",
            archive_prefix(app_name),
            Local::now().format("%m%d-%H%M%S")
        );
        let dest = self.dir.join(file_name);

        let mut tmp = NamedTempFile::new_in(&self.dir).at("create temp file in", &self.dir)?;
        let count = match reuse {
            Some(source) => {
                let mut input = File::open(source).at("open", source)?;
                io::copy(&mut input, tmp.as_file_mut()).at("copy", source)?;
                None
            }
            None => Some(write_assets_zip(tmp.as_file_mut(), assets)?),
        };
        tmp.as_file().sync_all().at("sync", tmp.path())?;
        tmp.persist(&dest).map_err(|e| e.error).at("write", &dest)?;

        for old in self.archives(app_name)? {
            if old == dest || reuse.is_some_and(|r| r == old) {
                continue;
            }
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "Failed to delete old backup");
            }
        }

        info!(path = %dest.display(), "Backed up plug-ins");
        Ok(BackupSnapshot {
            path: dest,
            assets: count,
        })
    }

    /// The newest archive of `app_name`, checked to open as a zip.
    ///
    /// Returned as a one-element input list for
    /// [`Injector::inject`](crate::Injector::inject).
    pub fn restore_latest(&self, app_name: &str) -> Result<Vec<PathBuf>> {
        let mut archives = self
            .archives(app_name)?
            .into_iter()
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect::<Vec<_>>();
        archives.sort_by(|a, b| b.cmp(a));

        let (_, latest) = archives
            .into_iter()
            .next()
            .ok_or_else(|| Error::BackupNotFound {
                app: app_name.to_string(),
            })?;

        let file = File::open(&latest).at("open", &latest)?;
        ZipArchive::new(file)?;

        debug!(path = %latest.display(), "Restoring from backup");
        Ok(vec![latest])
    }

    /// Zip `assets` into `dest`. Missing assets are skipped.
    pub fn export(&self, assets: &[PathBuf], dest: &Path) -> Result<usize> {
        let dir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir).at("create", dir)?;
        let mut tmp = NamedTempFile::new_in(dir).at("create temp file in", dir)?;
        let count = write_assets_zip(tmp.as_file_mut(), assets)?;
        tmp.persist(dest).map_err(|e| e.error).at("write", dest)?;
        Ok(count)
    }

    /// Archives in the backups directory belonging to `app_name`.
    fn archives(&self, app_name: &str) -> Result<Vec<PathBuf>> {
        let prefix = archive_prefix(app_name);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).at("read", &self.dir),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry.at("read", &self.dir)?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".zip") {
                found.push(path);
            }
        }
        Ok(found)
    }
}

fn archive_prefix(app_name: &str) -> String {
    format!("{app_name}Plugins_")
}

/// Deflate `assets` into a zip written to `writer`, each asset at the top
/// level. Returns the number of assets archived.
pub fn write_assets_zip<W: Write + Seek>(writer: W, assets: &[PathBuf]) -> Result<usize> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut count = 0;

    for asset in assets {
        if fs::symlink_metadata(asset).is_err() {
            warn!(path = %asset.display(), "Skipping missing plug-in");
            continue;
        }
        let base = asset.parent().unwrap_or(Path::new(""));

        for entry in WalkDir::new(asset).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from).at("walk", asset)?;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let archive_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let metadata = fs::symlink_metadata(path).at("inspect", path)?;
            if metadata.is_dir() {
                zip.add_directory(format!("{archive_path}/"), options)?;
            } else if metadata.file_type().is_symlink() {
                let target = fs::read_link(path).at("read link", path)?;
                zip.add_symlink(archive_path, target.to_string_lossy(), options)?;
            } else {
                #[cfg(unix)]
                let options = {
                    use std::os::unix::fs::PermissionsExt;
                    options.unix_permissions(metadata.permissions().mode())
                };
                zip.start_file(archive_path, options)?;
                let mut file = File::open(path).at("open", path)?;
                io::copy(&mut file, &mut zip).at("archive", path)?;
            }
        }
        count += 1;
    }

    zip.finish()?;
    Ok(count)
}
