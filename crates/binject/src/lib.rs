pub mod app;
pub mod backup;
pub mod codesign;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod files;
pub mod injector;
pub mod lock;
pub mod macho;
pub mod metadata;
pub mod preprocess;

pub use app::{AppBundle, AppKind};
pub use backup::{BackupManager, BackupSnapshot};
pub use config::InjectorConfig;
pub use diagnostics::DiagnosticLog;
pub use error::{EjectFailure, EjectionError, Error, ErrorKind, InjectionError, ValidationError};
pub use injector::{Injector, Stage};
pub use lock::BundleLocks;
pub use macho::{
    AdhocSigner, LoadReference, MachOPatcher, PatchError, SignError, Signer, SigningIdentity,
};
pub use metadata::{MetadataBatch, MetadataError, MetadataStore};
pub use preprocess::{AssetKind, Preprocessor, SourceKind, StagedAsset, StagedSet};

pub type Result<T> = std::result::Result<T, Error>;
