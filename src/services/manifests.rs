use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{LauncherError, Result};
use crate::models::FileTask;
use crate::utils::paths::{join_relative, LauncherPaths};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionManifest {
    pub id: String,
    pub assets: String,
    pub asset_index: AssetIndexRef,
    pub downloads: VersionDownloads,
    #[serde(default)]
    pub libraries: Vec<Library>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetIndexRef {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub sha1: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VersionDownloads {
    pub client: DownloadRef,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DownloadRef {
    pub url: String,
    #[serde(default)]
    pub sha1: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Library {
    pub name: String,
    #[serde(default)]
    pub downloads: Option<LibraryDownloads>,
    #[serde(default)]
    pub natives: HashMap<String, String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Maven repository base, used by loader profiles that carry no
    /// `downloads` block.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LibraryDownloads {
    #[serde(default)]
    pub artifact: Option<Artifact>,
    #[serde(default)]
    pub classifiers: HashMap<String, Artifact>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Artifact {
    #[serde(default)]
    pub path: Option<String>,
    pub url: String,
    #[serde(default)]
    pub sha1: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Rule {
    pub action: String,
    #[serde(default)]
    pub os: Option<OsRule>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OsRule {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetIndex {
    pub objects: BTreeMap<String, AssetObject>,
    #[serde(default)]
    pub map_to_resources: bool,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetObject {
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderProfile {
    #[serde(default)]
    pub main_class: Option<String>,
    #[serde(default)]
    pub libraries: Vec<Library>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ExtraDependency {
    pub url: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

/// `{ "<dir relative to the instance>": { "<file>": ExtraDependency } }`
pub type ExtraDependencies = BTreeMap<String, BTreeMap<String, ExtraDependency>>;

pub fn parse<T: DeserializeOwned>(value: &Value, what: &str) -> Result<T> {
    T::deserialize(value)
        .map_err(|err| LauncherError::ManifestParse(format!("{}: {}", what, err)))
}

pub fn current_os_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    }
}

fn current_arch_bits() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "64"
    } else {
        "32"
    }
}

impl Library {
    /// Mojang rule semantics: no rules allows everything, otherwise the last
    /// matching rule decides.
    pub fn allowed_on(&self, os_name: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let mut allowed = false;
        for rule in &self.rules {
            let matches = match rule.os.as_ref().and_then(|os| os.name.as_deref()) {
                Some(name) => name == os_name,
                None => true,
            };
            if matches {
                allowed = rule.action == "allow";
            }
        }
        allowed
    }

    fn native_classifier(&self, os_name: &str) -> Option<String> {
        self.natives
            .get(os_name)
            .map(|classifier| classifier.replace("${arch}", current_arch_bits()))
    }
}

/// `group:artifact:version[:classifier]` to its repository-relative path.
pub fn maven_path(coordinate: &str) -> Option<String> {
    let parts: Vec<&str> = coordinate.split(':').collect();
    if parts.len() < 3 || parts.iter().take(3).any(|part| part.is_empty()) {
        return None;
    }
    let group = parts[0].replace('.', "/");
    let artifact = parts[1];
    let version = parts[2];
    let file_name = match parts.get(3) {
        Some(classifier) => format!("{}-{}-{}.jar", artifact, version, classifier),
        None => format!("{}-{}.jar", artifact, version),
    };
    Some(format!("{}/{}/{}/{}", group, artifact, version, file_name))
}

fn library_tasks(libraries: &[Library], paths: &LauncherPaths, os_name: &str) -> Vec<FileTask> {
    let libraries_dir = paths.libraries_dir();
    let mut tasks = Vec::new();
    for library in libraries {
        if !library.allowed_on(os_name) {
            continue;
        }
        match library.downloads.as_ref() {
            Some(downloads) => {
                if let Some(artifact) = downloads.artifact.as_ref() {
                    let relative = artifact
                        .path
                        .clone()
                        .or_else(|| maven_path(&library.name));
                    if let Some(relative) = relative {
                        tasks.push(FileTask::download(
                            artifact.url.clone(),
                            join_relative(&libraries_dir, &relative),
                            artifact.sha1.clone(),
                        ));
                    }
                }
                let native = library
                    .native_classifier(os_name)
                    .and_then(|classifier| downloads.classifiers.get(&classifier));
                if let Some(native) = native {
                    let relative = native.path.clone().or_else(|| {
                        library
                            .native_classifier(os_name)
                            .and_then(|classifier| maven_path(&format!("{}:{}", library.name, classifier)))
                    });
                    if let Some(relative) = relative {
                        let mut task = FileTask::download(
                            native.url.clone(),
                            join_relative(&libraries_dir, &relative),
                            native.sha1.clone(),
                        );
                        task.extract_natives = true;
                        tasks.push(task);
                    }
                }
            }
            None => {
                let (Some(base), Some(relative)) = (library.url.as_deref(), maven_path(&library.name))
                else {
                    tracing::debug!("library {} has no download source", library.name);
                    continue;
                };
                tasks.push(FileTask::download(
                    format!("{}/{}", base.trim_end_matches('/'), relative),
                    join_relative(&libraries_dir, &relative),
                    None,
                ));
            }
        }
    }
    tasks
}

pub fn asset_url(resources_url: &str, hash: &str) -> String {
    let prefix = hash.get(..2).unwrap_or(hash);
    format!("{}/{}/{}", resources_url.trim_end_matches('/'), prefix, hash)
}

/// Libraries, native archives, asset objects and the client jar of one
/// version, in that order.
pub fn core_tasks(
    version: &VersionManifest,
    index: &AssetIndex,
    paths: &LauncherPaths,
    resources_url: &str,
) -> Vec<FileTask> {
    let mut tasks = library_tasks(&version.libraries, paths, current_os_name());
    let legacy = uses_legacy_layout(version, index);
    for (key, object) in &index.objects {
        let task = FileTask::download(
            asset_url(resources_url, &object.hash),
            paths.asset_object(&object.hash),
            Some(object.hash.clone()),
        );
        tasks.push(if legacy {
            task.with_legacy_mirror(paths.legacy_asset(key))
        } else {
            task
        });
    }
    tasks.push(FileTask::download(
        version.downloads.client.url.clone(),
        paths.client_jar(&version.id),
        version.downloads.client.sha1.clone(),
    ));
    tasks
}

pub fn uses_legacy_layout(version: &VersionManifest, index: &AssetIndex) -> bool {
    version.assets == "legacy" || index.is_virtual
}

pub fn loader_tasks(profile: &LoaderProfile, paths: &LauncherPaths) -> Vec<FileTask> {
    library_tasks(&profile.libraries, paths, current_os_name())
}

/// Entries already installed at the recorded version are left out.
pub fn extra_dependency_tasks(
    current: &ExtraDependencies,
    previous: &ExtraDependencies,
    paths: &LauncherPaths,
    instance_name: &str,
) -> Vec<FileTask> {
    let instance_dir = paths.instance_dir(instance_name);
    let mut tasks = Vec::new();
    for (dir, files) in current {
        for (file, dependency) in files {
            let destination = join_relative(&join_relative(&instance_dir, dir), file);
            let unchanged = previous
                .get(dir)
                .and_then(|known| known.get(file))
                .map(|known| known.version == dependency.version)
                .unwrap_or(false);
            if unchanged && destination.exists() {
                continue;
            }
            tasks.push(FileTask::download(
                dependency.url.clone(),
                destination,
                dependency.sha1.clone(),
            ));
        }
    }
    tasks
}

pub fn native_archives(tasks: &[FileTask]) -> Vec<PathBuf> {
    tasks
        .iter()
        .filter(|task| task.extract_natives)
        .map(|task| task.destination.clone())
        .collect()
}
