//! Injection and ejection transactions on one application bundle.
//!
//! An [`Injector`] is cheap to build and bound to a single bundle. Every
//! transaction takes the bundle's lock from the shared [`BundleLocks`]
//! table, writes its steps to the app's diagnostic log and either completes
//! or unwinds:
//!
//! ```text
//! Start -> Preprocess -> Backup -> PatchSign -> MarkFinal -> Done
//! ```
//!
//! A failure in `Preprocess` writes nothing. A failure in `Backup` may
//! leave a new archive but never touches the bundle. From `PatchSign` on,
//! placed files and the executable are restored on failure.
//!
//! [`BundleLocks`]: crate::lock::BundleLocks

use crate::app::AppBundle;
use crate::backup::BackupManager;
use crate::config::InjectorConfig;
use crate::diagnostics::DiagnosticLog;
use crate::error::{EjectFailure, EjectionError, InjectionError, IoResultExt, ValidationError};
use crate::files::{remove_item, FileJournal};
use crate::macho::{LoadReference, MachOPatcher, SigningIdentity};
use crate::metadata::{MetadataBatch, MetadataError, MetadataStore};
use crate::preprocess::{AssetKind, Preprocessor, SourceKind, StagedAsset};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Step of an injection transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Preprocess,
    Backup,
    PatchSign,
    MarkFinal,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Start => "Start",
            Stage::Preprocess => "Preprocess",
            Stage::Backup => "Backup",
            Stage::PatchSign => "Patch+Sign",
            Stage::MarkFinal => "MarkFinal",
            Stage::Done => "Done",
        })
    }
}

type ReloadHook = Box<dyn Fn() + Send + Sync>;

/// Injects and ejects plug-ins of one application.
///
/// # Example
///
/// ```no_run
/// use binject::{AppBundle, Injector, InjectorConfig};
/// use std::path::PathBuf;
///
/// let app = AppBundle::from_bundle_root("/var/containers/Bundle/Application/X/Demo.app")?;
/// let injector = Injector::new(app, InjectorConfig::new());
/// let log = injector.inject(&[PathBuf::from("/tmp/Tweak.dylib")])?;
/// println!("log written to {}", log.display());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Injector {
    app: AppBundle,
    config: InjectorConfig,
    metadata: MetadataStore,
    backups: BackupManager,
    reload: Option<ReloadHook>,
    last_log: Mutex<Option<PathBuf>>,
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("app", &self.app)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Injector {
    pub fn new(app: AppBundle, config: InjectorConfig) -> Self {
        let metadata = MetadataStore::open(&app.root);
        let backups = BackupManager::new(config.backups_path());
        Self {
            app,
            config,
            metadata,
            backups,
            reload: None,
            last_log: Mutex::new(None),
        }
    }

    /// Called after every inject or eject transaction, successful or not.
    pub fn on_reload(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.reload = Some(Box::new(hook));
        self
    }

    pub fn app(&self) -> &AppBundle {
        &self.app
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn app_id(&self) -> &str {
        &self.app.bundle_id
    }

    pub fn set_app_id(&mut self, bundle_id: impl Into<String>) {
        self.app.bundle_id = bundle_id.into();
    }

    pub fn team_id(&self) -> Option<&str> {
        self.app.team_id.as_deref()
    }

    pub fn set_team_id(&mut self, team_id: impl Into<String>) {
        self.app.team_id = Some(team_id.into());
    }

    /// Log of the latest transaction, or the app's log file if one exists.
    pub fn latest_log_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.last_log.lock().clone() {
            return Some(path);
        }
        let path = self
            .config
            .logs_path()
            .join(format!("{}.log", self.app.bundle_id));
        path.exists().then_some(path)
    }

    /// Inject `assets` (loose plug-ins, zips or Debian packages).
    ///
    /// Returns the path of the diagnostic log.
    pub fn inject(&self, assets: &[PathBuf]) -> std::result::Result<PathBuf, InjectionError> {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.write();
        let log = self.open_log();
        log.info(format!(
            "Injecting {} input(s) into {} ({})",
            assets.len(),
            self.app.name,
            self.app.root.display()
        ));

        let mut stage = Stage::Start;
        let result = self.run_inject(assets, &log, &mut stage);
        self.fire_reload();

        match result {
            Ok(()) => {
                log.info(format!("Stage {}", Stage::Done));
                Ok(log.path().to_path_buf())
            }
            Err(source) => {
                log.error(format!("{stage} failed: {source}"));
                Err(InjectionError {
                    stage,
                    source,
                    log_path: Some(log.path().to_path_buf()),
                })
            }
        }
    }

    fn run_inject(&self, assets: &[PathBuf], log: &DiagnosticLog, stage: &mut Stage) -> Result<()> {
        enter(stage, Stage::Preprocess, log);
        let staged = self.preprocessor().stage(assets)?;
        for asset in staged.assets() {
            log.info(format!(
                "Staged {} {} from {}",
                asset.kind,
                asset.file_name().to_string_lossy(),
                asset.source.display()
            ));
        }

        enter(stage, Stage::Backup, log);
        let reuse = match assets {
            [single] if SourceKind::detect(single) == SourceKind::Zip => Some(single.as_path()),
            _ => None,
        };
        let snapshot = self
            .backups
            .snapshot(&self.app.name, &self.injected_paths(), reuse)?;
        log.info(format!("Backup written to {}", snapshot.path.display()));

        enter(stage, Stage::PatchSign, log);
        let mut journal = FileJournal::new();
        let mut additions = Vec::new();
        let mut batch = MetadataBatch::new();
        for asset in staged.assets() {
            let dest = self.destination(asset);
            journal.place(&asset.path, &dest)?;
            log.info(format!("Placed {}", dest.display()));
            if let Some(reference) = self.load_reference(asset.kind, &dest) {
                additions.push(reference);
            }
            batch = batch.mark(dest, asset.provenance);
        }

        let patch = self
            .patcher()
            .apply(&self.app.executable, &additions, &[])
            .map_err(|e| Error::patch(&self.app.executable, e))?;
        for reference in &additions {
            log.info(format!("Load reference {reference}"));
        }

        enter(stage, Stage::MarkFinal, log);
        if let Err(e) = self.metadata.commit(batch) {
            if let Err(revert) = patch.revert() {
                log.error(format!("Failed to revert executable: {revert}"));
            }
            journal.rollback();
            return Err(e.into());
        }
        journal.commit();
        Ok(())
    }

    /// Remove the load references, files and markers of `assets`.
    ///
    /// Paths may be absolute or relative to the bundle root.
    pub fn eject(&self, assets: &[PathBuf]) -> std::result::Result<(), EjectionError> {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.write();
        let log = self.open_log();
        log.info(format!("Ejecting {} plug-in(s) from {}", assets.len(), self.app.name));

        let result = self.run_eject(assets, &log);
        self.fire_reload();
        result
    }

    fn run_eject(&self, assets: &[PathBuf], log: &DiagnosticLog) -> std::result::Result<(), EjectionError> {
        let log_path = Some(log.path().to_path_buf());
        let aborted = |source: Error| {
            log.error(format!("Ejection aborted: {source}"));
            EjectionError::Aborted {
                source,
                log_path: log_path.clone(),
            }
        };

        let mut targets = Vec::with_capacity(assets.len());
        for asset in assets {
            let relative = self
                .bundle_relative(asset)
                .ok_or_else(|| aborted(ValidationError::OutsideBundle(asset.clone()).into()))?;
            targets.push(self.app.root.join(relative));
        }

        let executable = &self.app.executable;
        let patcher = self.patcher();
        let existing = patcher
            .load_references(executable)
            .map_err(|e| aborted(Error::patch(executable, e)))?;

        // Only marked plug-ins, or plug-ins loaded through our prefix, may go
        for target in &targets {
            let is_plugin = AssetKind::from_path(target).is_some()
                && (self.metadata.provenance(target).is_some()
                    || existing.iter().any(|r| self.references_asset(r, target)));
            if !is_plugin {
                return Err(aborted(ValidationError::NotAPlugin(target.clone()).into()));
            }
        }

        let removals: Vec<LoadReference> = existing
            .into_iter()
            .filter(|reference| targets.iter().any(|t| self.references_asset(reference, t)))
            .collect();
        patcher
            .apply(executable, &[], &removals)
            .map_err(|e| aborted(Error::patch(executable, e)))?;
        for reference in &removals {
            log.info(format!("Removed load reference {reference}"));
        }

        let mut failures = Vec::new();
        for target in &targets {
            let removed = remove_item(target).at("remove", target);
            let unmark = match &removed {
                Ok(()) => true,
                Err(Error::Path { source, .. }) => source.kind() == io::ErrorKind::NotFound,
                Err(_) => false,
            };
            if let Err(error) = removed {
                log.warn(format!("Failed to remove {}: {error}", target.display()));
                failures.push(EjectFailure {
                    asset: target.clone(),
                    error,
                });
            } else {
                log.info(format!("Removed {}", target.display()));
            }
            if unmark {
                if let Err(e) = self.metadata.unmark(target) {
                    log.warn(format!("Failed to unmark {}: {e}", target.display()));
                    failures.push(EjectFailure {
                        asset: target.clone(),
                        error: e.into(),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            log.error(format!("{} of {} plug-ins failed to eject", failures.len(), targets.len()));
            Err(EjectionError::Partial {
                failures,
                total: targets.len(),
                log_path,
            })
        }
    }

    /// Eject every injected plug-in. An empty set is a no-op.
    pub fn eject_all(&self) -> std::result::Result<(), EjectionError> {
        let assets = {
            let lock = self.config.lock_table().for_bundle(&self.app.root);
            let _guard = lock.read();
            self.injected_paths()
        };
        if assets.is_empty() {
            return Ok(());
        }
        self.eject(&assets)
    }

    pub fn set_detached(&self, detached: bool) -> std::result::Result<(), MetadataError> {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.write();
        self.metadata.set_detached(detached)?;
        tracing::info!(app = %self.app.bundle_id, detached, "Updated detached flag");
        Ok(())
    }

    pub fn is_detached(&self) -> bool {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.read();
        self.metadata.is_detached()
    }

    /// Absolute paths of the injected plug-ins.
    pub fn list_injected_assets(&self) -> Vec<PathBuf> {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.read();
        self.injected_paths()
    }

    /// Loader-relative references in the executable that look like plug-ins
    /// but were not injected by this tool.
    pub fn foreign_load_references(&self) -> Result<Vec<LoadReference>> {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.read();

        let injected = self.injected_paths();
        let prefix = self.config.prefix();
        let references = self
            .patcher()
            .load_references(&self.app.executable)
            .map_err(|e| Error::patch(&self.app.executable, e))?;

        Ok(references
            .into_iter()
            .filter(|r| r.path().starts_with(prefix) || r.path().starts_with("@rpath/"))
            .filter(|r| !injected.iter().any(|asset| self.references_asset(r, asset)))
            .collect())
    }

    /// Re-inject the newest backup of this app.
    pub fn restore_last_configuration(&self) -> std::result::Result<PathBuf, InjectionError> {
        let inputs = self
            .backups
            .restore_latest(&self.app.name)
            .map_err(|source| InjectionError {
                stage: Stage::Start,
                source,
                log_path: self.latest_log_path(),
            })?;
        self.inject(&inputs)
    }

    /// Zip the injected plug-ins into `dest`. Returns how many were archived.
    pub fn export_plugins(&self, dest: &Path) -> Result<usize> {
        let lock = self.config.lock_table().for_bundle(&self.app.root);
        let _guard = lock.read();
        self.backups.export(&self.injected_paths(), dest)
    }

    fn injected_paths(&self) -> Vec<PathBuf> {
        self.metadata
            .injected()
            .into_keys()
            .map(|relative| self.app.root.join(relative))
            .collect()
    }

    fn open_log(&self) -> DiagnosticLog {
        let log = DiagnosticLog::open(self.config.logs_path(), &self.app.bundle_id);
        *self.last_log.lock() = Some(log.path().to_path_buf());
        log
    }

    fn fire_reload(&self) {
        if let Some(reload) = &self.reload {
            reload();
        }
    }

    fn preprocessor(&self) -> Preprocessor {
        self.config
            .ignored_names()
            .iter()
            .fold(Preprocessor::new(self.config.staging_path()), |p, name| {
                p.ignore_name(name)
            })
    }

    fn patcher(&self) -> MachOPatcher {
        MachOPatcher::new(self.config.signer_handle(), SigningIdentity::for_app(&self.app))
    }

    fn destination(&self, asset: &StagedAsset) -> PathBuf {
        let dir = match asset.kind {
            AssetKind::Dylib | AssetKind::Framework => self.app.frameworks_dir(),
            AssetKind::Bundle => self.app.root.clone(),
        };
        dir.join(asset.file_name())
    }

    /// Load reference for a plug-in placed at `dest`.
    fn load_reference(&self, kind: AssetKind, dest: &Path) -> Option<LoadReference> {
        let name = dest.file_name()?.to_str()?;
        match kind {
            AssetKind::Dylib => Some(LoadReference::under(self.config.prefix(), name)),
            AssetKind::Framework => {
                let executable = framework_executable(dest)?;
                Some(LoadReference::under(
                    self.config.prefix(),
                    &format!("{name}/{executable}"),
                ))
            }
            AssetKind::Bundle => None,
        }
    }

    /// Whether `reference` loads the plug-in at `asset`.
    fn references_asset(&self, reference: &LoadReference, asset: &Path) -> bool {
        let Some(name) = asset.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let Some(rest) = reference.path().strip_prefix(self.config.prefix()) else {
            return false;
        };
        match AssetKind::from_path(asset) {
            Some(AssetKind::Dylib) => rest == name,
            Some(AssetKind::Framework) => rest
                .strip_prefix(name)
                .is_some_and(|tail| tail.starts_with('/')),
            _ => false,
        }
    }

    /// `asset` relative to the bundle root, or `None` when it is outside.
    fn bundle_relative(&self, asset: &Path) -> Option<PathBuf> {
        let relative = if asset.is_absolute() {
            match asset.strip_prefix(&self.app.root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => {
                    let root = fs::canonicalize(&self.app.root).ok()?;
                    let parent = fs::canonicalize(asset.parent()?).ok()?;
                    parent
                        .join(asset.file_name()?)
                        .strip_prefix(&root)
                        .ok()?
                        .to_path_buf()
                }
            }
        } else {
            asset.to_path_buf()
        };

        let normal = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        (normal && !relative.as_os_str().is_empty()).then_some(relative)
    }
}

fn enter(stage: &mut Stage, next: Stage, log: &DiagnosticLog) {
    *stage = next;
    log.info(format!("Stage {next}"));
}

/// `CFBundleExecutable` of a framework, falling back to its stem.
fn framework_executable(framework: &Path) -> Option<String> {
    plist::Value::from_file(framework.join("Info.plist"))
        .ok()
        .and_then(|v| {
            v.as_dictionary()?
                .get("CFBundleExecutable")?
                .as_string()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            framework
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
}
