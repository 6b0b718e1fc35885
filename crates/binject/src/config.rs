//! Injector configuration.

use crate::lock::BundleLocks;
use crate::macho::{AdhocSigner, Signer, DEFAULT_LOAD_PREFIX};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Settings shared by every [`Injector`](crate::Injector) transaction.
///
/// # Example
///
/// ```ignore
/// use binject::InjectorConfig;
///
/// let config = InjectorConfig::new()
///     .backups_dir("/var/mobile/Documents/PlugInsBackups")
///     .ignore_name("libcrane.dylib");
/// ```
#[derive(Clone)]
pub struct InjectorConfig {
    backups_dir: PathBuf,
    logs_dir: PathBuf,
    staging_root: PathBuf,
    load_prefix: String,
    ignored_names: Vec<String>,
    signer: Arc<dyn Signer>,
    locks: Arc<BundleLocks>,
}

impl InjectorConfig {
    /// Defaults: backups in `$HOME/Documents/PlugInsBackups`, logs in
    /// `$HOME/Library/Logs/binject`, staging in the system temp dir, ad-hoc
    /// signing. Without `$HOME` the first two live under the temp dir.
    pub fn new() -> Self {
        let base = env::var_os("HOME").map(PathBuf::from);
        let temp = env::temp_dir();
        let (backups_dir, logs_dir) = match base {
            Some(home) => (
                home.join("Documents").join("PlugInsBackups"),
                home.join("Library").join("Logs").join("binject"),
            ),
            None => (
                temp.join("binject").join("PlugInsBackups"),
                temp.join("binject").join("Logs"),
            ),
        };

        Self {
            backups_dir,
            logs_dir,
            staging_root: temp,
            load_prefix: DEFAULT_LOAD_PREFIX.to_string(),
            ignored_names: Vec::new(),
            signer: Arc::new(AdhocSigner),
            locks: Arc::new(BundleLocks::new()),
        }
    }

    pub fn backups_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.backups_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn logs_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.logs_dir = path.as_ref().to_path_buf();
        self
    }

    /// Parent of the per-transaction staging directories.
    pub fn staging_root(mut self, path: impl AsRef<Path>) -> Self {
        self.staging_root = path.as_ref().to_path_buf();
        self
    }

    /// Prefix of injected load references.
    pub fn load_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.load_prefix = prefix.into();
        self
    }

    /// Skip plug-ins with this file name in addition to the built-in
    /// hooking-framework list. Compared case-insensitively.
    pub fn ignore_name(mut self, name: impl Into<String>) -> Self {
        self.ignored_names.push(name.into());
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    /// Share a lock table between configurations.
    pub fn locks(mut self, locks: Arc<BundleLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn backups_path(&self) -> &Path {
        &self.backups_dir
    }

    pub fn logs_path(&self) -> &Path {
        &self.logs_dir
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_root
    }

    pub fn prefix(&self) -> &str {
        &self.load_prefix
    }

    pub fn ignored_names(&self) -> &[String] {
        &self.ignored_names
    }

    pub(crate) fn signer_handle(&self) -> Arc<dyn Signer> {
        Arc::clone(&self.signer)
    }

    pub(crate) fn lock_table(&self) -> &BundleLocks {
        &self.locks
    }
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InjectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectorConfig")
            .field("backups_dir", &self.backups_dir)
            .field("logs_dir", &self.logs_dir)
            .field("staging_root", &self.staging_root)
            .field("load_prefix", &self.load_prefix)
            .field("ignored_names", &self.ignored_names)
            .finish_non_exhaustive()
    }
}
