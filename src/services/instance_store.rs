use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::errors::{LauncherError, Result};
use crate::models::{DomainEvent, Instance, InstanceConfig, LoaderDescriptor, ModRecord};
use crate::utils::file::{FileManager, WriteMode, WriteOutcome};
use crate::utils::hash::murmur2_fingerprint;
use crate::utils::paths::LauncherPaths;

const EVENT_CAPACITY: usize = 256;

/// Canonical instance cache. Every `config.json` mutation goes through
/// [`InstanceStore::update_instance_config`]; the cached copy is re-read from
/// disk after each write.
#[derive(Clone)]
pub struct InstanceStore {
    paths: LauncherPaths,
    files: FileManager,
    inner: Arc<Mutex<HashMap<String, InstanceConfig>>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    events: broadcast::Sender<DomainEvent>,
}

impl InstanceStore {
    pub fn new(paths: LauncherPaths) -> Self {
        let files = FileManager::new(paths.instances_dir());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            paths,
            files,
            inner: Arc::new(Mutex::new(HashMap::new())),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            events,
        }
    }

    pub fn paths(&self) -> &LauncherPaths {
        &self.paths
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DomainEvent) {
        tracing::info!("{:?}", event);
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InstanceConfig>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, name: &str) -> Option<InstanceConfig> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn list(&self) -> Vec<Instance> {
        let map = self.lock();
        let mut items: Vec<Instance> = map
            .iter()
            .map(|(name, config)| Instance {
                name: name.clone(),
                config: config.clone(),
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    fn read_from_disk(&self, name: &str) -> Result<InstanceConfig> {
        let value = self.files.read_config_value(name)?;
        serde_json::from_value(value).map_err(|err| {
            LauncherError::ManifestParse(format!("config of instance {}: {}", name, err))
        })
    }

    /// Scans the instances directory and caches every parsable config.
    pub async fn load_all(&self) -> Result<usize> {
        let root = self.paths.instances_dir();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut loaded = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.read_from_disk(&name) {
                Ok(config) => {
                    loaded.insert(name, config);
                }
                Err(err) => tracing::warn!("skipping instance {}: {}", name, err),
            }
        }
        let count = loaded.len();
        *self.lock() = loaded;
        tracing::info!("loaded {} instances from {}", count, root.display());
        Ok(count)
    }

    /// Applies `mutate` to the current config and persists it atomically.
    /// Writers are serialized; the cache entry is re-derived from disk.
    pub async fn update_instance_config<F>(
        &self,
        name: &str,
        mode: WriteMode,
        mutate: F,
    ) -> Result<InstanceConfig>
    where
        F: FnOnce(&mut InstanceConfig),
    {
        let _gate = self.write_gate.lock().await;
        let mut config = match self.get(name) {
            Some(config) => config,
            None => self.read_from_disk(name)?,
        };
        mutate(&mut config);
        self.persist(name, &config, mode)
    }

    fn persist(&self, name: &str, config: &InstanceConfig, mode: WriteMode) -> Result<InstanceConfig> {
        let document = serde_json::to_value(config)?;
        if self.files.write_config(name, &document, mode)? == WriteOutcome::Unchanged {
            tracing::debug!("config of {} unchanged", name);
        }
        let stored = self.read_from_disk(name)?;
        self.lock().insert(name.to_string(), stored.clone());
        Ok(stored)
    }

    /// Force-writes the initial config of an instance being installed,
    /// keeping play time, mods and custom settings of an existing one.
    pub async fn create_or_merge(
        &self,
        name: &str,
        loader: LoaderDescriptor,
    ) -> Result<InstanceConfig> {
        let _gate = self.write_gate.lock().await;
        let config = match self.read_from_disk(name) {
            Ok(mut existing) => {
                existing.loader = loader;
                existing
            }
            Err(_) => InstanceConfig::new(loader),
        };
        self.persist(name, &config, WriteMode::Force)
    }

    /// Drops the mod record, then deletes the file from `mods/`.
    pub async fn delete_mod(&self, instance: &str, file_name: &str) -> Result<()> {
        if !self.contains(instance) {
            return Err(LauncherError::NotFound(format!("instance {}", instance)));
        }
        self.update_instance_config(instance, WriteMode::Force, |config| {
            config.mods.retain(|record| record.file_name != file_name);
        })
        .await?;
        let path = self.paths.instance_mods(instance).join(file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.emit(DomainEvent::ModRemoved {
            instance: instance.to_string(),
            file_name: file_name.to_string(),
        });
        Ok(())
    }

    pub async fn handle_mod_added(&self, instance: &str, path: &Path) -> Result<()> {
        let Some(config) = self.get(instance) else {
            tracing::debug!("mod added to unknown instance {}", instance);
            return Ok(());
        };
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        if config.find_mod(file_name).is_some() || !path.is_file() {
            return Ok(());
        }

        let fingerprint_path = path.to_path_buf();
        let fingerprint = tokio::task::spawn_blocking(move || murmur2_fingerprint(&fingerprint_path))
            .await
            .map_err(|err| LauncherError::Config(err.to_string()))?
            .map_err(|err| {
                tracing::warn!("cannot fingerprint {}: {}", path.display(), err);
                err
            })
            .ok();

        let record = ModRecord {
            file_name: file_name.to_string(),
            project_id: None,
            file_id: None,
            display_name: file_name.to_string(),
            package_fingerprint: fingerprint,
        };
        self.update_instance_config(instance, WriteMode::IfChanged, move |config| {
            if config.find_mod(&record.file_name).is_none() {
                config.mods.push(record);
            }
        })
        .await?;
        self.emit(DomainEvent::ModAdded {
            instance: instance.to_string(),
            file_name: file_name.to_string(),
        });
        Ok(())
    }

    pub async fn handle_mod_removed(&self, instance: &str, file_name: &str) -> Result<()> {
        let known = self
            .get(instance)
            .map(|config| config.find_mod(file_name).is_some())
            .unwrap_or(false);
        if !known {
            return Ok(());
        }
        self.update_instance_config(instance, WriteMode::IfChanged, |config| {
            config.mods.retain(|record| record.file_name != file_name);
        })
        .await?;
        self.emit(DomainEvent::ModRemoved {
            instance: instance.to_string(),
            file_name: file_name.to_string(),
        });
        Ok(())
    }

    pub async fn handle_mod_renamed(&self, instance: &str, from: &str, to: &str) -> Result<()> {
        let known = self
            .get(instance)
            .map(|config| config.find_mod(from).is_some())
            .unwrap_or(false);
        if !known {
            return Ok(());
        }
        self.update_instance_config(instance, WriteMode::IfChanged, |config| {
            for record in config.mods.iter_mut().filter(|record| record.file_name == from) {
                record.file_name = to.to_string();
            }
        })
        .await?;
        self.emit(DomainEvent::ModRenamed {
            instance: instance.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    pub async fn handle_instance_added(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Ok(());
        }
        let config = self.read_from_disk(name)?;
        self.lock().insert(name.to_string(), config);
        self.emit(DomainEvent::InstanceAdded {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn handle_instance_removed(&self, name: &str) -> Result<()> {
        if self.lock().remove(name).is_some() {
            self.emit(DomainEvent::InstanceRemoved {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn handle_instance_renamed(&self, from: &str, to: &str) -> Result<()> {
        if self.contains(to) {
            return Ok(());
        }
        let config = self.read_from_disk(to)?;
        {
            let mut map = self.lock();
            map.remove(from);
            map.insert(to.to_string(), config);
        }
        self.emit(DomainEvent::InstanceRenamed {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }
}
