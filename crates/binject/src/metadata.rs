//! Persistent injection markers and the detached flag.
//!
//! State lives in `.binject.plist` next to the bundle (in its container
//! directory), so it survives reinstalls of the bundle contents but not
//! removal of the app. The document is re-read before every update and
//! replaced atomically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the metadata document.
pub const METADATA_FILE_NAME: &str = ".binject.plist";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to write metadata {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode metadata: {0}")]
    Encode(#[from] plist::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Document {
    #[serde(default)]
    detached: bool,
    /// Relative asset path to provenance flag.
    #[serde(default)]
    injected: BTreeMap<String, bool>,
}

/// Changes applied together by [`MetadataStore::commit`].
#[derive(Debug, Default, Clone)]
pub struct MetadataBatch {
    marks: Vec<(PathBuf, bool)>,
    unmarks: Vec<PathBuf>,
    detached: Option<bool>,
}

impl MetadataBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(mut self, path: impl Into<PathBuf>, provenance: bool) -> Self {
        self.marks.push((path.into(), provenance));
        self
    }

    pub fn unmark(mut self, path: impl Into<PathBuf>) -> Self {
        self.unmarks.push(path.into());
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = Some(detached);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty() && self.unmarks.is_empty() && self.detached.is_none()
    }
}

/// Markers of one application bundle.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    bundle_root: PathBuf,
    path: PathBuf,
}

impl MetadataStore {
    pub fn open(bundle_root: impl AsRef<Path>) -> Self {
        let bundle_root = bundle_root.as_ref().to_path_buf();
        let container = bundle_root.parent().unwrap_or(&bundle_root);
        let path = container.join(METADATA_FILE_NAME);
        Self { bundle_root, path }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_detached(&self) -> bool {
        self.load().detached
    }

    /// Whether the OS may replace the app with an update.
    pub fn permits_replacement(&self) -> bool {
        !self.is_detached()
    }

    pub fn set_detached(&self, detached: bool) -> Result<(), MetadataError> {
        self.commit(MetadataBatch::new().detached(detached))
    }

    pub fn mark_injected(&self, path: &Path, provenance: bool) -> Result<(), MetadataError> {
        self.commit(MetadataBatch::new().mark(path, provenance))
    }

    pub fn unmark(&self, path: &Path) -> Result<(), MetadataError> {
        self.commit(MetadataBatch::new().unmark(path))
    }

    /// Provenance flag of `path`, or `None` when it is not marked.
    pub fn provenance(&self, path: &Path) -> Option<bool> {
        self.load().injected.get(&self.key(path)).copied()
    }

    /// Every marked asset as a path relative to the bundle root.
    pub fn injected(&self) -> BTreeMap<PathBuf, bool> {
        self.load()
            .injected
            .into_iter()
            .map(|(k, v)| (PathBuf::from(k), v))
            .collect()
    }

    /// Apply `batch` in one document write.
    pub fn commit(&self, batch: MetadataBatch) -> Result<(), MetadataError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut doc = self.load();
        for path in &batch.unmarks {
            doc.injected.remove(&self.key(path));
        }
        for (path, provenance) in &batch.marks {
            doc.injected.insert(self.key(path), *provenance);
        }
        if let Some(detached) = batch.detached {
            doc.detached = detached;
        }

        self.store(&doc)?;
        debug!(
            path = %self.path.display(),
            marks = batch.marks.len(),
            unmarks = batch.unmarks.len(),
            "Committed metadata"
        );
        Ok(())
    }

    /// Key of `path`: relative to the bundle root, `/`-separated.
    fn key(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.bundle_root).unwrap_or(path);
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn load(&self) -> Document {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Document::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable metadata, using defaults");
                return Document::default();
            }
        };

        plist::from_bytes(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Corrupt metadata, using defaults");
            Document::default()
        })
    }

    fn store(&self, doc: &Document) -> Result<(), MetadataError> {
        let mut encoded = Vec::new();
        plist::to_writer_xml(&mut encoded, doc)?;

        let write_err = |source| MetadataError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&encoded).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}
