//! Per-application diagnostic log.
//!
//! Every transaction appends timestamped lines to
//! `<logs_dir>/<bundle-id>.log`. The file is rotated to `<bundle-id>.log.1`
//! once it grows past [`MAX_LOG_SIZE`]. Lines are mirrored to `tracing`.
//! Writing the log is best effort and never fails a transaction.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Rotation threshold in bytes.
pub const MAX_LOG_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
pub struct DiagnosticLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl DiagnosticLog {
    /// Open (or create) the log of `bundle_id` under `logs_dir`.
    pub fn open(logs_dir: &Path, bundle_id: &str) -> Self {
        let path = logs_dir.join(format!("{bundle_id}.log"));
        let file = fs::create_dir_all(logs_dir)
            .and_then(|_| rotate_if_needed(&path))
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

        let file = match file {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Diagnostic log unavailable");
                None
            }
        };

        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write(Level::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.write(Level::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(Level::Error, message.as_ref());
    }

    pub fn write(&self, level: Level, message: &str) {
        match level {
            Level::Info => info!(target: "binject::diagnostics", "{message}"),
            Level::Warn => warn!(target: "binject::diagnostics", "{message}"),
            Level::Error => error!(target: "binject::diagnostics", "{message}"),
        }

        let mut file = self.file.lock();
        if let Some(file) = file.as_mut() {
            let line = format!(
                "{} [{}] {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level.as_str(),
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(path = %self.path.display(), error = %e, "Failed to append to diagnostic log");
            }
        }
    }
}

fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > MAX_LOG_SIZE => {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            fs::rename(path, PathBuf::from(rotated))
        }
        _ => Ok(()),
    }
}
