//! Mach-O load-command patching and re-signing.
//!
//! [`MachOPatcher`] edits the dependent-library table of every slice of a
//! thin or universal executable, hands each edited slice to a [`Signer`],
//! and replaces the file with a single atomic rename.

pub mod parser;
pub mod patcher;
pub mod signer;
pub mod writer;

pub use parser::{ArchSlice, MachOFile, SliceLayout};
pub use patcher::{AppliedPatch, MachOPatcher};
pub use signer::{AdhocSigner, Signer, SigningIdentity};

use std::fmt;
use std::io;
use thiserror::Error;

/// Load command type for LC_LOAD_DYLIB
pub const LC_LOAD_DYLIB: u32 = 0xc;

/// Load command type for LC_LOAD_WEAK_DYLIB
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | 0x8000_0000;

/// Load command type for LC_CODE_SIGNATURE
pub const LC_CODE_SIGNATURE: u32 = 0x1d;

/// Size of a mach_header_64
pub const MACH_HEADER_64_SIZE: usize = 32;

/// Size of a dylib_command without its trailing name
pub const DYLIB_COMMAND_SIZE: usize = 24;

/// Size of a linkedit_data_command
pub const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

/// Default prefix of injected load references.
pub const DEFAULT_LOAD_PREFIX: &str = "@executable_path/Frameworks/";

/// Failure while patching an executable.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The input is not a parseable Mach-O.
    #[error("Corrupt Mach-O: {0}")]
    MachOCorrupt(String),

    /// The slice is not a 64-bit little-endian arm64/arm64e/x86_64 image.
    #[error("Unsupported architecture: {arch}")]
    UnsupportedArchitecture { arch: String },

    /// Growing the load commands would overwrite the first section.
    #[error("{arch}: insufficient header padding (need {needed} bytes, {available} available)")]
    InsufficientHeaderPadding {
        arch: String,
        needed: usize,
        available: usize,
    },

    /// The slice is FairPlay encrypted.
    #[error("{arch}: slice is encrypted")]
    Encrypted { arch: String },

    /// The Signing Manager rejected the patched slice.
    #[error("{arch}: signing failed: {source}")]
    Signing {
        arch: String,
        #[source]
        source: SignError,
    },

    /// Reading or replacing the executable failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure while producing a code signature for a slice.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("Slice has no __LINKEDIT segment")]
    MissingLinkedit,

    #[error("Slice has no __TEXT segment")]
    MissingText,

    /// An unsigned slice has no room for an LC_CODE_SIGNATURE command.
    #[error("No room for LC_CODE_SIGNATURE (need {needed} bytes, {available} available)")]
    NoRoomForSignatureCommand { needed: usize, available: usize },

    #[error("Malformed slice: {0}")]
    Malformed(String),

    /// The signature does not fit in 32-bit Mach-O offsets.
    #[error("Signature exceeds 4 GiB limit")]
    Overflow,

    /// Rejected by a custom [`Signer`].
    #[error("{0}")]
    Rejected(String),
}

/// A dependent-library entry in a load-command table, keyed by its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadReference {
    path: String,
}

impl LoadReference {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Reference to `relative` under a loader-relative `prefix`.
    pub fn under(prefix: &str, relative: &str) -> Self {
        if prefix.ends_with('/') {
            Self::new(format!("{prefix}{relative}"))
        } else {
            Self::new(format!("{prefix}/{relative}"))
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for LoadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Aligns a value up to the specified power-of-two alignment.
pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
pub(crate) mod testutil;
