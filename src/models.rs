use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    Vanilla,
    Fabric,
    Forge,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoaderDescriptor {
    pub loader_type: LoaderKind,
    pub mc_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoaderDescriptor {
    pub fn vanilla(mc_version: &str) -> Self {
        Self {
            loader_type: LoaderKind::Vanilla,
            mc_version: mc_version.to_string(),
            loader_version: None,
            extra: Map::new(),
        }
    }

    pub fn fabric(mc_version: &str, loader_version: &str) -> Self {
        Self {
            loader_type: LoaderKind::Fabric,
            mc_version: mc_version.to_string(),
            loader_version: Some(loader_version.to_string()),
            extra: Map::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModRecord {
    pub file_name: String,
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
    #[serde(rename = "fileID", default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<u64>,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_fingerprint: Option<u32>,
}

/// The document stored in `<instance>/config.json`. The instance name is the
/// directory name and is never part of the document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub loader: LoaderDescriptor,
    #[serde(default)]
    pub mods: Vec<ModRecord>,
    #[serde(default)]
    pub time_played: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(flatten)]
    pub custom_settings: Map<String, Value>,
}

impl InstanceConfig {
    pub fn new(loader: LoaderDescriptor) -> Self {
        Self {
            loader,
            mods: Vec::new(),
            time_played: 0,
            last_played: None,
            background: None,
            custom_settings: Map::new(),
        }
    }

    pub fn find_mod(&self, file_name: &str) -> Option<&ModRecord> {
        self.mods.iter().find(|record| record.file_name == file_name)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Instance {
    pub name: String,
    #[serde(flatten)]
    pub config: InstanceConfig,
}

/// One unit of transfer for the fetcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTask {
    pub source_url: Option<String>,
    pub destination: PathBuf,
    pub expected_hash: Option<String>,
    pub legacy_mirror: Option<PathBuf>,
    pub extract_natives: bool,
}

impl FileTask {
    pub fn download(url: impl Into<String>, destination: PathBuf, hash: Option<String>) -> Self {
        Self {
            source_url: Some(url.into()),
            destination,
            expected_hash: hash,
            legacy_mirror: None,
            extract_natives: false,
        }
    }

    pub fn delete(destination: PathBuf) -> Self {
        Self {
            source_url: None,
            destination,
            expected_hash: None,
            legacy_mirror: None,
            extract_natives: false,
        }
    }

    pub fn with_legacy_mirror(mut self, mirror: PathBuf) -> Self {
        self.legacy_mirror = Some(mirror);
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Add,
    Remove,
    Modify,
    Rename,
}

impl ChangeAction {
    /// Numeric action codes used by the native watcher bridge.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Add),
            1 => Some(Self::Remove),
            2 => Some(Self::Modify),
            3 => Some(Self::Rename),
            _ => None,
        }
    }
}

/// A raw filesystem notification as delivered by the watcher.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub directory: PathBuf,
    #[serde(default)]
    pub file: Option<String>,
    pub action: ChangeAction,
    #[serde(default)]
    pub old_file: Option<String>,
    #[serde(default)]
    pub new_file: Option<String>,
    #[serde(default)]
    pub new_directory: Option<PathBuf>,
}

impl ChangeRecord {
    pub fn new(directory: impl Into<PathBuf>, file: &str, action: ChangeAction) -> Self {
        Self {
            directory: directory.into(),
            file: Some(file.to_string()),
            action,
            old_file: None,
            new_file: None,
            new_directory: None,
        }
    }

    pub fn rename(
        directory: impl Into<PathBuf>,
        old_file: &str,
        new_directory: impl Into<PathBuf>,
        new_file: &str,
    ) -> Self {
        Self {
            directory: directory.into(),
            file: None,
            action: ChangeAction::Rename,
            old_file: Some(old_file.to_string()),
            new_file: Some(new_file.to_string()),
            new_directory: Some(new_directory.into()),
        }
    }

    /// Path the record is tracked under. For renames this is the old path, so
    /// the ADD emitted next to a rename collides with the pending entry.
    pub fn tracked_path(&self) -> Option<PathBuf> {
        self.file
            .as_deref()
            .or(self.old_file.as_deref())
            .map(|name| self.directory.join(name))
    }

    pub fn is_rename(&self) -> bool {
        self.old_file.is_some() && self.new_file.is_some()
    }

    pub fn renamed_path(&self) -> Option<PathBuf> {
        match (&self.new_directory, &self.new_file) {
            (Some(dir), Some(file)) => Some(dir.join(file)),
            (None, Some(file)) => Some(self.directory.join(file)),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    Queued,
    CheckingCoreFiles,
    DownloadingCoreFiles,
    ExtractingNatives,
    CopyingAssets,
    DownloadingLoaderFiles,
    DownloadingExtraDependencies,
    Complete,
    Failed,
}

impl InstallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn status_text(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::CheckingCoreFiles => "Checking game files",
            Self::DownloadingCoreFiles => "Downloading game files...",
            Self::ExtractingNatives => "Extracting game files...",
            Self::CopyingAssets => "Copying assets...",
            Self::DownloadingLoaderFiles => "Downloading fabric files...",
            Self::DownloadingExtraDependencies => "Downloading extra dependencies...",
            Self::Complete => "Complete",
            Self::Failed => "Download failed",
        }
    }
}

/// Semantic change to the canonical instance state.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ModAdded { instance: String, file_name: String },
    ModRemoved { instance: String, file_name: String },
    ModRenamed { instance: String, from: String, to: String },
    InstanceAdded { name: String },
    InstanceRemoved { name: String },
    InstanceRenamed { from: String, to: String },
}
