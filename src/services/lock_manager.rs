use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use crate::errors::LauncherError;
use crate::utils::paths::LauncherPaths;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    pid: u32,
    acquired_at: i64,
}

/// Advisory `installing.lock` per instance. Failures are logged, never fatal:
/// the launcher itself is the only writer the lock protects against.
#[derive(Clone)]
pub struct LockManager {
    paths: LauncherPaths,
    stale_check: bool,
}

impl LockManager {
    pub fn new(paths: LauncherPaths, stale_check: bool) -> Self {
        Self { paths, stale_check }
    }

    fn lock_path(&self, instance_name: &str) -> PathBuf {
        self.paths.instance_lock(instance_name)
    }

    /// Returns whether this call created the lock.
    pub fn acquire(&self, instance_name: &str) -> bool {
        let path = self.lock_path(instance_name);
        if path.exists() && !self.is_locked(instance_name) {
            tracing::warn!("removing stale install lock for {}", instance_name);
            let _ = fs::remove_file(&path);
        }

        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().timestamp(),
        };
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| {
                let payload = serde_json::to_vec(&record).map_err(std::io::Error::from)?;
                file.write_all(&payload)
            });

        match result {
            Ok(()) => true,
            Err(err) => {
                let err = if err.kind() == ErrorKind::AlreadyExists {
                    LauncherError::LockContention(format!("{} is already locked", instance_name))
                } else {
                    LauncherError::LockContention(format!(
                        "cannot lock {}: {}",
                        instance_name, err
                    ))
                };
                tracing::warn!("{}", err);
                false
            }
        }
    }

    pub fn release(&self, instance_name: &str) {
        match fs::remove_file(self.lock_path(instance_name)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("failed to release lock for {}: {}", instance_name, err),
        }
    }

    pub fn is_locked(&self, instance_name: &str) -> bool {
        let path = self.lock_path(instance_name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return false,
            Err(_) => return path.exists(),
        };
        if !self.stale_check {
            return true;
        }
        match serde_json::from_slice::<LockRecord>(&raw) {
            Ok(record) => process_alive(record.pid),
            // Unknown format: assume someone holds it.
            Err(_) => true,
        }
    }
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}
