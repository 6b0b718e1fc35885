//! Turning user inputs into a flat set of injectable plug-ins.
//!
//! Inputs may be loose `.dylib`/`.framework`/`.bundle` items, zip archives
//! or Debian packages. Everything is staged into a transaction-owned
//! temporary directory; the inputs themselves are never modified.
//!
//! Provenance flags are only provisional here. The orchestrator commits
//! them to the metadata store once the executable has been patched.

pub mod debian;
pub mod extract;

pub use debian::{collect_assets, unpack_data};
pub use extract::extract_zip;

use crate::error::{IoResultExt, ValidationError};
use crate::files::copy_item;
use crate::Result;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Hooking runtimes that must never be injected into an app.
pub const DEFAULT_IGNORED_NAMES: [&str; 5] = [
    "CydiaSubstrate.framework",
    "libsubstrate.dylib",
    "libsubstitute.dylib",
    "libellekit.dylib",
    "libhooker.dylib",
];

/// Kind of an injectable plug-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Dylib,
    Framework,
    Bundle,
}

impl AssetKind {
    /// Kind implied by the extension of `path`, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "dylib" => Some(AssetKind::Dylib),
            "framework" => Some(AssetKind::Framework),
            "bundle" => Some(AssetKind::Bundle),
            _ => None,
        }
    }

    /// Whether the executable gets a load reference for this kind.
    pub fn is_loadable(self) -> bool {
        !matches!(self, AssetKind::Bundle)
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssetKind::Dylib => "dylib",
            AssetKind::Framework => "framework",
            AssetKind::Bundle => "bundle",
        })
    }
}

/// How an input path is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Zip,
    DebianPackage,
    Loose(AssetKind),
    Unsupported,
}

impl SourceKind {
    pub fn detect(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("zip") => SourceKind::Zip,
            Some("deb") => SourceKind::DebianPackage,
            _ => AssetKind::from_path(path)
                .map(SourceKind::Loose)
                .unwrap_or(SourceKind::Unsupported),
        }
    }
}

/// A plug-in copied into the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAsset {
    pub kind: AssetKind,
    /// Location inside the staging directory.
    pub path: PathBuf,
    /// Input the asset came from.
    pub source: PathBuf,
    /// Provisional provenance marker.
    pub provenance: bool,
}

impl StagedAsset {
    fn new(kind: AssetKind, path: PathBuf, source: &Path) -> Self {
        Self {
            kind,
            path,
            source: source.to_path_buf(),
            provenance: kind == AssetKind::Bundle,
        }
    }

    pub fn file_name(&self) -> &OsStr {
        self.path.file_name().unwrap_or_default()
    }
}

/// Staged assets together with the directory that owns them. The
/// directory is removed when the set is dropped.
#[derive(Debug)]
pub struct StagedSet {
    dir: TempDir,
    assets: Vec<StagedAsset>,
}

impl StagedSet {
    pub fn assets(&self) -> &[StagedAsset] {
        &self.assets
    }

    pub fn staging_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Stages inputs below a staging root.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    staging_root: PathBuf,
    ignored: Vec<String>,
}

impl Preprocessor {
    pub fn new(staging_root: impl AsRef<Path>) -> Self {
        Self {
            staging_root: staging_root.as_ref().to_path_buf(),
            ignored: DEFAULT_IGNORED_NAMES
                .iter()
                .map(|n| n.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Also drop plug-ins named `name`.
    pub fn ignore_name(mut self, name: &str) -> Self {
        self.ignored.push(name.to_ascii_lowercase());
        self
    }

    pub fn is_ignored(&self, name: &OsStr) -> bool {
        let name = name.to_string_lossy().to_ascii_lowercase();
        self.ignored.iter().any(|n| *n == name)
    }

    /// Stage `inputs` in order.
    ///
    /// Ignored names are removed and later duplicates of a file name are
    /// dropped. Fails with [`ValidationError::NoValidPlugins`] when nothing
    /// is left.
    pub fn stage(&self, inputs: &[PathBuf]) -> Result<StagedSet> {
        fs::create_dir_all(&self.staging_root).at("create", &self.staging_root)?;
        let dir = tempfile::Builder::new()
            .prefix("binject-staging-")
            .tempdir_in(&self.staging_root)
            .at("create staging directory in", &self.staging_root)?;

        let mut staged = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            match SourceKind::detect(input) {
                SourceKind::Zip => {
                    let out = dir.path().join(format!("{index:03}_{name}.extracted"));
                    extract_zip(input, &out)?;
                    staged.extend(top_level_assets(&out, input)?);
                }
                SourceKind::DebianPackage => {
                    let out = dir.path().join(format!("{index:03}_{name}.extracted"));
                    unpack_data(input, &out)?;
                    staged.extend(
                        collect_assets(&out)?
                            .into_iter()
                            .map(|(path, kind)| StagedAsset::new(kind, path, input)),
                    );
                }
                SourceKind::Loose(kind) => {
                    let dest = dir.path().join(format!("{index:03}")).join(&name);
                    copy_item(input, &dest)?;
                    staged.push(StagedAsset::new(kind, dest, input));
                }
                SourceKind::Unsupported => {
                    debug!(path = %input.display(), "Skipping unsupported input");
                }
            }
        }

        let assets = self.filter(staged);
        if assets.is_empty() {
            return Err(ValidationError::NoValidPlugins.into());
        }

        info!(count = assets.len(), "Staged plug-ins");
        Ok(StagedSet { dir, assets })
    }

    fn filter(&self, staged: Vec<StagedAsset>) -> Vec<StagedAsset> {
        let mut seen = HashSet::new();
        staged
            .into_iter()
            .filter(|asset| {
                if self.is_ignored(asset.file_name()) {
                    debug!(name = ?asset.file_name(), "Dropping ignored plug-in");
                    return false;
                }
                if !seen.insert(asset.file_name().to_os_string()) {
                    debug!(
                        name = ?asset.file_name(),
                        source = %asset.source.display(),
                        "Dropping duplicate plug-in"
                    );
                    return false;
                }
                true
            })
            .collect()
    }
}

/// Qualifying entries directly inside an extracted zip, sorted by name.
fn top_level_assets(dir: &Path, source: &Path) -> Result<Vec<StagedAsset>> {
    let mut entries = fs::read_dir(dir)
        .at("read", dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .at("read", dir)?;
    entries.sort();

    Ok(entries
        .into_iter()
        .filter_map(|path| {
            let kind = AssetKind::from_path(&path)?;
            Some(StagedAsset::new(kind, path, source))
        })
        .collect())
}
