use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{LauncherError, Result};
use crate::utils::paths::{CONFIG_FILE, CONFIG_TEMP_FILE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Skip the write when the file on disk already holds the same document.
    IfChanged,
    Force,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Owner of every write to an instance's `config.json`.
#[derive(Clone)]
pub struct FileManager {
    instances_dir: PathBuf,
}

impl FileManager {
    pub fn new(instances_dir: PathBuf) -> Self {
        Self { instances_dir }
    }

    pub fn instances_dir(&self) -> &Path {
        &self.instances_dir
    }

    pub fn config_path(&self, instance_name: &str) -> PathBuf {
        self.instances_dir.join(instance_name).join(CONFIG_FILE)
    }

    pub fn read_config_value(&self, instance_name: &str) -> Result<Value> {
        let raw = fs::read(self.config_path(instance_name))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persists `document` as `<instance>/config.json` through a verified
    /// temporary sibling and an atomic rename. The instance directory must
    /// already exist.
    pub fn write_config(
        &self,
        instance_name: &str,
        document: &Value,
        mode: WriteMode,
    ) -> Result<WriteOutcome> {
        let instance_dir = self.instances_dir.join(instance_name);
        let config_path = instance_dir.join(CONFIG_FILE);
        let temp_path = instance_dir.join(CONFIG_TEMP_FILE);

        if !document.is_object() {
            return Err(LauncherError::CorruptWrite(format!(
                "cannot write config for {}: document is not an object",
                instance_name
            )));
        }
        let payload = serde_json::to_vec(document)?;

        if config_path.exists() && mode == WriteMode::IfChanged {
            match fs::read(&config_path) {
                Ok(existing) => {
                    let same = serde_json::from_slice::<Value>(&existing)
                        .map(|current| &current == document)
                        .unwrap_or(false);
                    if same {
                        return Ok(WriteOutcome::Unchanged);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "config read failed for {}, rewriting: {}",
                        instance_name,
                        err
                    );
                }
            }
        }

        if let Err(err) = write_verified(&temp_path, &payload) {
            if temp_path.is_file() {
                let _ = fs::remove_file(&temp_path);
            }
            tracing::error!("config write aborted for {}: {}", instance_name, err);
            return Err(LauncherError::CorruptWrite(format!(
                "{}: {}",
                temp_path.display(),
                err
            )));
        }

        fs::rename(&temp_path, &config_path)?;
        Ok(WriteOutcome::Written)
    }
}

fn write_verified(temp_path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;
    let written = file.write(payload)?;
    if written != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {} of {} bytes", written, payload.len()),
        ));
    }
    file.sync_all()?;
    drop(file);

    let mut readback = Vec::with_capacity(payload.len());
    File::open(temp_path)?.read_to_end(&mut readback)?;
    if readback != payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "content corrupted after write",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn manager_with_instance(name: &str) -> FileManager {
        let dir = std::env::temp_dir().join(format!("launcher-sync-file-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join(name)).expect("create instance dir");
        FileManager::new(dir)
    }

    #[test]
    fn writes_missing_config_unconditionally() {
        let files = manager_with_instance("foo");
        let document = json!({"loader": {"loaderType": "vanilla", "mcVersion": "1.20.1"}});
        let outcome = files
            .write_config("foo", &document, WriteMode::IfChanged)
            .expect("write config");
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(files.read_config_value("foo").expect("read back"), document);
        assert!(!files.instances_dir().join("foo").join(CONFIG_TEMP_FILE).exists());
    }

    #[test]
    fn identical_document_is_not_rewritten_unless_forced() {
        let files = manager_with_instance("foo");
        let document = json!({"timePlayed": 3});
        files
            .write_config("foo", &document, WriteMode::Force)
            .expect("first write");
        assert_eq!(
            files
                .write_config("foo", &document, WriteMode::IfChanged)
                .expect("second write"),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            files
                .write_config("foo", &document, WriteMode::Force)
                .expect("forced write"),
            WriteOutcome::Written
        );
    }

    #[test]
    fn unreadable_prior_config_is_replaced() {
        let files = manager_with_instance("foo");
        std::fs::write(files.config_path("foo"), b"{not json").expect("seed corrupt config");
        let document = json!({"timePlayed": 1});
        assert_eq!(
            files
                .write_config("foo", &document, WriteMode::IfChanged)
                .expect("repair write"),
            WriteOutcome::Written
        );
        assert_eq!(files.read_config_value("foo").expect("read"), document);
    }

    #[test]
    fn failed_temp_write_preserves_original_bytes() {
        let files = manager_with_instance("foo");
        let original = br#"{"timePlayed":7}"#.to_vec();
        std::fs::write(files.config_path("foo"), &original).expect("seed config");
        // A directory squatting on the temp path makes the temp write fail.
        std::fs::create_dir_all(files.instances_dir().join("foo").join(CONFIG_TEMP_FILE))
            .expect("block temp path");

        let err = files
            .write_config("foo", &json!({"timePlayed": 8}), WriteMode::Force)
            .expect_err("write must fail");
        assert!(matches!(err, LauncherError::CorruptWrite(_)));
        assert_eq!(std::fs::read(files.config_path("foo")).expect("read"), original);
    }

    #[test]
    fn refuses_non_object_documents_and_missing_dirs() {
        let files = manager_with_instance("foo");
        assert!(matches!(
            files.write_config("foo", &json!([1, 2]), WriteMode::Force),
            Err(LauncherError::CorruptWrite(_))
        ));
        assert!(files
            .write_config("ghost", &json!({}), WriteMode::Force)
            .is_err());
        assert!(!files.instances_dir().join("ghost").exists());
    }
}
