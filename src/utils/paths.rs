use std::path::{Component, Path, PathBuf};

use crate::config::env_string;
use crate::models::ChangeAction;

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_TEMP_FILE: &str = "config_new_temp.json";
pub const LOCK_FILE: &str = "installing.lock";
pub const MODS_DIR: &str = "mods";
pub const LEGACY_FIXER_FILE: &str = "__JLF__.jar";

const MOD_EXTENSIONS: [&str; 2] = ["jar", "disabled"];

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

/// Data root: `LAUNCHER_SYNC_ROOT_DIR`, then a portable install next to the
/// executable, then the platform data directory, then the working directory.
pub fn resolve_root_dir() -> PathBuf {
    if let Some(value) = env_string("LAUNCHER_SYNC_ROOT_DIR") {
        let path = PathBuf::from(value);
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    let platform_dir = if cfg!(target_os = "windows") {
        std::env::var_os("APPDATA").map(|base| PathBuf::from(base).join("launcher_sync"))
    } else if cfg!(target_os = "macos") {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("launcher_sync")
        })
    } else {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
            .map(|base| base.join("launcher_sync"))
    };
    if let Some(found) = platform_dir.as_deref().and_then(ensure_dir) {
        return found;
    }

    PathBuf::from(".")
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(value) = env_string("LAUNCHER_SYNC_LOG_DIR") {
        let path = PathBuf::from(value);
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
    }
    let root_logs = root.join("logs");
    ensure_dir(&root_logs).unwrap_or(root_logs)
}

/// On-disk layout of the launcher data root.
#[derive(Clone, Debug)]
pub struct LauncherPaths {
    root: PathBuf,
}

impl LauncherPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn datastore_dir(&self) -> PathBuf {
        self.root.join("datastore")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.datastore_dir().join("versions")
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.datastore_dir().join("libraries")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.datastore_dir().join("assets")
    }

    pub fn extra_dependencies_file(&self) -> PathBuf {
        self.datastore_dir().join("extra_dependencies.json")
    }

    pub fn version_json(&self, mc_version: &str) -> PathBuf {
        self.versions_dir().join(format!("{}.json", mc_version))
    }

    pub fn client_jar(&self, version_id: &str) -> PathBuf {
        self.versions_dir().join(format!("{}.jar", version_id))
    }

    pub fn asset_index(&self, index_id: &str) -> PathBuf {
        self.assets_dir().join("indexes").join(format!("{}.json", index_id))
    }

    pub fn asset_object(&self, hash: &str) -> PathBuf {
        let prefix = hash.get(..2).unwrap_or(hash);
        self.assets_dir().join("objects").join(prefix).join(hash)
    }

    pub fn legacy_asset(&self, key: &str) -> PathBuf {
        join_relative(&self.assets_dir().join("virtual").join("legacy"), key)
    }

    pub fn fabric_profile(&self, mc_version: &str, loader_version: &str) -> PathBuf {
        self.libraries_dir()
            .join("net")
            .join("fabricmc")
            .join(mc_version)
            .join(loader_version)
            .join("fabric.json")
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir().join(name)
    }

    pub fn instance_config(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(CONFIG_FILE)
    }

    pub fn instance_lock(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(LOCK_FILE)
    }

    pub fn instance_mods(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(MODS_DIR)
    }

    pub fn instance_natives(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("natives")
    }

    pub fn instance_resource(&self, name: &str, key: &str) -> PathBuf {
        join_relative(&self.instance_dir(name).join("resources"), key)
    }
}

/// Joins a manifest-provided relative path, dropping any component that could
/// escape `base`.
pub fn join_relative(base: &Path, relative: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in Path::new(&relative.replace('\\', "/")).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

pub fn is_safe_relative_path(path: &Path) -> bool {
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}

fn relative_components<'a>(path: &'a Path, instances_root: &Path) -> Option<Vec<&'a str>> {
    let relative = path.strip_prefix(instances_root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts)
}

/// `<instances>/<name>`
pub fn is_instance_root(path: &Path, instances_root: &Path) -> bool {
    matches!(relative_components(path, instances_root), Some(parts) if parts.len() == 1)
}

/// `<instances>/<name>/mods/<file>.jar` (or `.disabled`)
pub fn is_mod_path(path: &Path, instances_root: &Path) -> bool {
    let Some(parts) = relative_components(path, instances_root) else {
        return false;
    };
    if parts.len() != 3 || parts[1] != MODS_DIR {
        return false;
    }
    Path::new(parts[2])
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MOD_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

pub fn instance_name_of(path: &Path, instances_root: &Path) -> Option<String> {
    relative_components(path, instances_root)
        .and_then(|parts| parts.first().map(|name| name.to_string()))
}

pub fn file_name_of(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

/// Semantic meaning of one settled filesystem change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeOutcome {
    ModAdded {
        instance: String,
        path: PathBuf,
    },
    ModRemoved {
        instance: String,
        file_name: String,
    },
    ModRenamed {
        instance: String,
        from: String,
        to: String,
    },
    /// A mod moved between instances: removed from one, added to the other.
    ModMoved {
        from_instance: String,
        file_name: String,
        to_instance: String,
        path: PathBuf,
    },
    InstanceAdded {
        name: String,
    },
    InstanceRemoved {
        name: String,
    },
    InstanceRenamed {
        from: String,
        to: String,
    },
    Ignored,
}

impl ChangeOutcome {
    /// Instances whose install lock must be free before this outcome applies.
    pub fn instances(&self) -> Vec<&str> {
        match self {
            Self::ModAdded { instance, .. }
            | Self::ModRemoved { instance, .. }
            | Self::ModRenamed { instance, .. } => vec![instance.as_str()],
            Self::ModMoved {
                from_instance,
                to_instance,
                ..
            } => vec![from_instance.as_str(), to_instance.as_str()],
            Self::InstanceAdded { name } | Self::InstanceRemoved { name } => vec![name.as_str()],
            Self::InstanceRenamed { from, to } => vec![from.as_str(), to.as_str()],
            Self::Ignored => Vec::new(),
        }
    }
}

pub fn classify_change(
    action: ChangeAction,
    path: &Path,
    new_path: Option<&Path>,
    instances_root: &Path,
) -> ChangeOutcome {
    let instance_of = |path: &Path| instance_name_of(path, instances_root);
    match (action, new_path) {
        (ChangeAction::Rename, Some(new_path)) => {
            classify_rename(path, new_path, instances_root)
        }
        (ChangeAction::Add, _) => {
            if is_mod_path(path, instances_root) {
                match instance_of(path) {
                    Some(instance) => ChangeOutcome::ModAdded {
                        instance,
                        path: path.to_path_buf(),
                    },
                    None => ChangeOutcome::Ignored,
                }
            } else if is_instance_root(path, instances_root) {
                instance_of(path)
                    .map(|name| ChangeOutcome::InstanceAdded { name })
                    .unwrap_or(ChangeOutcome::Ignored)
            } else {
                ChangeOutcome::Ignored
            }
        }
        (ChangeAction::Remove, _) => {
            if is_mod_path(path, instances_root) {
                match (instance_of(path), file_name_of(path)) {
                    (Some(instance), Some(file_name)) => {
                        ChangeOutcome::ModRemoved { instance, file_name }
                    }
                    _ => ChangeOutcome::Ignored,
                }
            } else if is_instance_root(path, instances_root) {
                instance_of(path)
                    .map(|name| ChangeOutcome::InstanceRemoved { name })
                    .unwrap_or(ChangeOutcome::Ignored)
            } else {
                ChangeOutcome::Ignored
            }
        }
        _ => ChangeOutcome::Ignored,
    }
}

fn classify_rename(old: &Path, new: &Path, instances_root: &Path) -> ChangeOutcome {
    let old_mod = is_mod_path(old, instances_root);
    let new_mod = is_mod_path(new, instances_root);
    let old_instance = instance_name_of(old, instances_root);
    let new_instance = instance_name_of(new, instances_root);

    if is_instance_root(old, instances_root) || is_instance_root(new, instances_root) {
        return match (
            is_instance_root(old, instances_root),
            is_instance_root(new, instances_root),
        ) {
            (true, true) => match (old_instance, new_instance) {
                (Some(from), Some(to)) => ChangeOutcome::InstanceRenamed { from, to },
                _ => ChangeOutcome::Ignored,
            },
            (true, false) => old_instance
                .map(|name| ChangeOutcome::InstanceRemoved { name })
                .unwrap_or(ChangeOutcome::Ignored),
            _ => new_instance
                .map(|name| ChangeOutcome::InstanceAdded { name })
                .unwrap_or(ChangeOutcome::Ignored),
        };
    }

    match (old_mod, new_mod, old_instance, new_instance) {
        (true, true, Some(from_instance), Some(to_instance)) => {
            let (Some(from), Some(to)) = (file_name_of(old), file_name_of(new)) else {
                return ChangeOutcome::Ignored;
            };
            if from_instance == to_instance {
                ChangeOutcome::ModRenamed {
                    instance: from_instance,
                    from,
                    to,
                }
            } else {
                ChangeOutcome::ModMoved {
                    from_instance,
                    file_name: from,
                    to_instance,
                    path: new.to_path_buf(),
                }
            }
        }
        (true, false, Some(instance), _) => match file_name_of(old) {
            Some(file_name) => ChangeOutcome::ModRemoved { instance, file_name },
            None => ChangeOutcome::Ignored,
        },
        (false, true, _, Some(instance)) => ChangeOutcome::ModAdded {
            instance,
            path: new.to_path_buf(),
        },
        _ => ChangeOutcome::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_mod_and_instance_paths() {
        let root = Path::new("/data/instances");
        assert!(is_instance_root(Path::new("/data/instances/foo"), root));
        assert!(!is_instance_root(Path::new("/data/instances/foo/mods"), root));
        assert!(!is_instance_root(Path::new("/data/other/foo"), root));

        assert!(is_mod_path(Path::new("/data/instances/foo/mods/a.jar"), root));
        assert!(is_mod_path(Path::new("/data/instances/foo/mods/a.JAR"), root));
        assert!(is_mod_path(Path::new("/data/instances/foo/mods/a.jar.disabled"), root));
        assert!(!is_mod_path(Path::new("/data/instances/foo/mods/readme.txt"), root));
        assert!(!is_mod_path(Path::new("/data/instances/foo/config/a.jar"), root));
        assert!(!is_mod_path(Path::new("/data/instances/foo/mods/sub/a.jar"), root));

        assert_eq!(
            instance_name_of(Path::new("/data/instances/foo/mods/a.jar"), root),
            Some("foo".to_string())
        );
        assert_eq!(instance_name_of(Path::new("/elsewhere/a.jar"), root), None);
    }

    #[test]
    fn relative_join_cannot_escape_base() {
        let base = Path::new("/data/assets/virtual/legacy");
        assert_eq!(
            join_relative(base, "../../etc/passwd"),
            PathBuf::from("/data/assets/virtual/legacy/etc/passwd")
        );
        assert_eq!(
            join_relative(base, "minecraft\\sounds\\a.ogg"),
            PathBuf::from("/data/assets/virtual/legacy/minecraft/sounds/a.ogg")
        );
    }

    #[test]
    fn classifies_plain_adds_and_removes() {
        let root = Path::new("/i");
        assert_eq!(
            classify_change(ChangeAction::Add, Path::new("/i/A/mods/x.jar"), None, root),
            ChangeOutcome::ModAdded {
                instance: "A".to_string(),
                path: PathBuf::from("/i/A/mods/x.jar")
            }
        );
        assert_eq!(
            classify_change(ChangeAction::Remove, Path::new("/i/A"), None, root),
            ChangeOutcome::InstanceRemoved {
                name: "A".to_string()
            }
        );
        assert_eq!(
            classify_change(ChangeAction::Modify, Path::new("/i/A/mods/x.jar"), None, root),
            ChangeOutcome::Ignored
        );
        assert_eq!(
            classify_change(ChangeAction::Add, Path::new("/i/A/saves/x.dat"), None, root),
            ChangeOutcome::Ignored
        );
    }

    #[test]
    fn classifies_renames() {
        let root = Path::new("/i");
        let rename = |old: &str, new: &str| {
            classify_change(ChangeAction::Rename, Path::new(old), Some(Path::new(new)), root)
        };

        assert_eq!(
            rename("/i/A/mods/x.jar", "/i/A/mods/x.jar.disabled"),
            ChangeOutcome::ModRenamed {
                instance: "A".to_string(),
                from: "x.jar".to_string(),
                to: "x.jar.disabled".to_string()
            }
        );
        let moved = rename("/i/A/mods/x.jar", "/i/B/mods/x.jar");
        assert_eq!(
            moved,
            ChangeOutcome::ModMoved {
                from_instance: "A".to_string(),
                file_name: "x.jar".to_string(),
                to_instance: "B".to_string(),
                path: PathBuf::from("/i/B/mods/x.jar")
            }
        );
        assert_eq!(moved.instances(), vec!["A", "B"]);
        assert_eq!(
            rename("/i/A/mods/x.jar", "/i/A/mods/x.txt"),
            ChangeOutcome::ModRemoved {
                instance: "A".to_string(),
                file_name: "x.jar".to_string()
            }
        );
        assert_eq!(
            rename("/i/A/mods/x.zip", "/i/A/mods/x.jar"),
            ChangeOutcome::ModAdded {
                instance: "A".to_string(),
                path: PathBuf::from("/i/A/mods/x.jar")
            }
        );
        assert_eq!(
            rename("/i/A", "/i/C"),
            ChangeOutcome::InstanceRenamed {
                from: "A".to_string(),
                to: "C".to_string()
            }
        );
        assert_eq!(rename("/i/A/a.txt", "/i/A/b.txt"), ChangeOutcome::Ignored);
    }

    #[test]
    fn layout_places_objects_by_hash_prefix() {
        let paths = LauncherPaths::new("/data");
        assert_eq!(
            paths.asset_object("ab12cd"),
            PathBuf::from("/data/datastore/assets/objects/ab/ab12cd")
        );
        assert_eq!(
            paths.instance_lock("foo"),
            PathBuf::from("/data/instances/foo/installing.lock")
        );
    }
}
