//! Error types for binject operations.
//!
//! Each component has its own closed error enum ([`PatchError`],
//! [`SignError`], [`MetadataError`], [`ValidationError`]); the crate-level
//! [`enum@Error`] wraps them together with I/O and archive failures.
//! [`Error::kind`] folds every variant into the five categories callers
//! branch on.
//!
//! The two public transactions report through [`InjectionError`] and
//! [`EjectionError`], which carry the failing stage and the path of the
//! diagnostic log written during the attempt.

use crate::injector::Stage;
use crate::macho::{PatchError, SignError};
use crate::metadata::MetadataError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Coarse classification of an [`enum@Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input rejected before anything was written.
    Validation,
    /// Copy, extraction or archive failure.
    Io,
    /// The executable could not be patched.
    BinaryPatch,
    /// The patched executable could not be re-signed.
    Signing,
    /// Provenance or detached-flag storage failed.
    Metadata,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
            ErrorKind::BinaryPatch => "binary patch",
            ErrorKind::Signing => "signing",
            ErrorKind::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// Input that can never be injected or ejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Nothing injectable was left after preprocessing.
    #[error("No valid plug-ins found")]
    NoValidPlugins,

    /// An ejection target does not live inside the application bundle.
    #[error("Not a plug-in of this application: {}", .0.display())]
    OutsideBundle(PathBuf),

    /// An ejection target is neither marked as injected nor loaded as a
    /// plug-in by the executable.
    #[error("Not an injected plug-in: {}", .0.display())]
    NotAPlugin(PathBuf),
}

/// Error type for binject operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected up front.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// I/O operation on a known path failed.
    #[error("Failed to {action} {}: {source}", .path.display())]
    Path {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Debian package is malformed or uses an unsupported compression.
    #[error("Invalid package {}: {reason}", .path.display())]
    Package { path: PathBuf, reason: String },

    /// Property list parsing failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// The executable could not be patched or re-signed.
    #[error("{}: {source}", .path.display())]
    BinaryPatch {
        path: PathBuf,
        #[source]
        source: PatchError,
    },

    /// Provenance or detached-flag storage failed.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// No backup archive exists for the application.
    #[error("No plug-in backup found for {app}")]
    BackupNotFound { app: String },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Io(_)
            | Error::Path { .. }
            | Error::Zip(_)
            | Error::Package { .. }
            | Error::Plist(_)
            | Error::BackupNotFound { .. } => ErrorKind::Io,
            Error::BinaryPatch { source, .. } => match source {
                PatchError::UnsupportedArchitecture { .. } => ErrorKind::Validation,
                PatchError::Signing { .. } => ErrorKind::Signing,
                PatchError::Io(_) => ErrorKind::Io,
                _ => ErrorKind::BinaryPatch,
            },
            Error::Metadata(_) => ErrorKind::Metadata,
        }
    }

    pub(crate) fn patch(path: &Path, source: PatchError) -> Self {
        Error::BinaryPatch {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn package(path: &Path, reason: impl Into<String>) -> Self {
        Error::Package {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Attach a path and an action to an [`io::Result`].
pub(crate) trait IoResultExt<T> {
    fn at(self, action: &'static str, path: &Path) -> crate::Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, action: &'static str, path: &Path) -> crate::Result<T> {
        self.map_err(|source| Error::Path {
            action,
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Failure of [`Injector::inject`](crate::Injector::inject).
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct InjectionError {
    /// Stage of the transaction that failed.
    pub stage: Stage,
    /// Underlying cause.
    #[source]
    pub source: Error,
    /// Diagnostic log written during the attempt.
    pub log_path: Option<PathBuf>,
}

impl InjectionError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// One plug-in that could not be ejected.
#[derive(Debug)]
pub struct EjectFailure {
    pub asset: PathBuf,
    pub error: Error,
}

impl fmt::Display for EjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.asset.display(), self.error)
    }
}

/// Failure of [`Injector::eject`](crate::Injector::eject).
#[derive(Debug, Error)]
pub enum EjectionError {
    /// Nothing was ejected; the executable and plug-ins are untouched.
    #[error("Ejection aborted: {source}")]
    Aborted {
        #[source]
        source: Error,
        log_path: Option<PathBuf>,
    },

    /// The load references were removed but some plug-ins could not be
    /// cleaned up. The others were ejected.
    #[error("{} of {total} plug-ins failed to eject", .failures.len())]
    Partial {
        failures: Vec<EjectFailure>,
        total: usize,
        log_path: Option<PathBuf>,
    },
}

impl EjectionError {
    pub fn failures(&self) -> &[EjectFailure] {
        match self {
            EjectionError::Aborted { .. } => &[],
            EjectionError::Partial { failures, .. } => failures,
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        match self {
            EjectionError::Aborted { log_path, .. } | EjectionError::Partial { log_path, .. } => {
                log_path.as_deref()
            }
        }
    }
}
