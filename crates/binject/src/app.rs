//! Application bundles as handed over by the app catalog.

use crate::error::IoResultExt;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Where an application was installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppKind {
    #[default]
    User,
    System,
    /// Installed through TrollStore.
    Troll,
}

/// An installed `.app` bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundle {
    pub root: PathBuf,
    pub executable: PathBuf,
    pub bundle_id: String,
    pub team_id: Option<String>,
    pub kind: AppKind,
    /// Display name; prefixes backup archive names.
    pub name: String,
}

impl AppBundle {
    /// Read `Info.plist` of the bundle at `root`.
    ///
    /// `CFBundleExecutable` and `CFBundleIdentifier` fall back to the
    /// bundle's file stem. The name prefers `CFBundleDisplayName`, then
    /// `CFBundleName`.
    pub fn from_bundle_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let info_plist_path = root.join("Info.plist");
        let plist_data = fs::read(&info_plist_path).at("read", &info_plist_path)?;
        let plist: plist::Value = plist::from_bytes(&plist_data)?;
        let dict = plist.as_dictionary();

        let string_key = |key: &str| {
            dict.and_then(|d| d.get(key))
                .and_then(|v| v.as_string())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };

        let stem = root
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let executable = string_key("CFBundleExecutable").unwrap_or_else(|| stem.clone());
        let bundle_id = string_key("CFBundleIdentifier").unwrap_or_else(|| stem.clone());
        let name = string_key("CFBundleDisplayName")
            .or_else(|| string_key("CFBundleName"))
            .unwrap_or(stem);

        Ok(Self {
            root: root.to_path_buf(),
            executable: root.join(executable),
            bundle_id,
            team_id: None,
            kind: AppKind::User,
            name,
        })
    }

    pub fn with_kind(mut self, kind: AppKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Directory holding the bundle, where the metadata document lives.
    pub fn container(&self) -> &Path {
        self.root.parent().unwrap_or(&self.root)
    }

    /// Directory that dylibs and frameworks are placed in.
    pub fn frameworks_dir(&self) -> PathBuf {
        self.root.join("Frameworks")
    }
}
