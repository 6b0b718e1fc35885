//! In-process reader/writer locks keyed by bundle path.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One `RwLock` per canonical bundle root.
///
/// Write transactions (inject, eject, detach) on the same bundle are
/// serialized. Reads run concurrently with each other but not with a write.
#[derive(Debug, Default)]
pub struct BundleLocks {
    table: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl BundleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding `bundle_root`. Paths that resolve to the same bundle
    /// share one lock.
    ///
    /// Entries no caller holds any more are dropped on each lookup.
    pub fn for_bundle(&self, bundle_root: &Path) -> Arc<RwLock<()>> {
        let key = fs::canonicalize(bundle_root).unwrap_or_else(|_| bundle_root.to_path_buf());
        let mut table = self.table.lock();
        table.retain(|path, lock| *path == key || Arc::strong_count(lock) > 1);
        table.entry(key).or_default().clone()
    }
}
