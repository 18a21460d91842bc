use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use zip::ZipArchive;

use crate::config::EngineSettings;
use crate::errors::{LauncherError, Result};
use crate::models::{FileTask, InstallPhase, LoaderDescriptor, LoaderKind};
use crate::services::fetcher::{Fetcher, ProgressCallback};
use crate::services::instance_store::InstanceStore;
use crate::services::lock_manager::LockManager;
use crate::services::manifests::{
    self, AssetIndex, ExtraDependencies, LoaderProfile, VersionManifest,
};
use crate::services::metadata::{ManifestRequest, MetadataSource};
use crate::utils::file::WriteMode;
use crate::utils::hash::verify_file;
use crate::utils::paths::{is_safe_relative_path, LauncherPaths};

pub const DOWNLOAD_FAILED_MESSAGE: &str = "Download failed, please retry after a while";
const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub name: String,
    pub loader: LoaderDescriptor,
}

impl InstallRequest {
    pub fn new(name: impl Into<String>, loader: LoaderDescriptor) -> Self {
        Self {
            name: name.into(),
            loader,
        }
    }
}

/// `name=mc_version` or `name=mc_version:fabric_loader_version`
impl FromStr for InstallRequest {
    type Err = LauncherError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || {
            LauncherError::Config(format!(
                "expected name=mc_version[:loader_version], got '{}'",
                value
            ))
        };
        let (name, version) = value.split_once('=').ok_or_else(invalid)?;
        let name = name.trim();
        if name.is_empty() || !is_safe_relative_path(Path::new(name)) || name.contains(['/', '\\']) {
            return Err(invalid());
        }
        let loader = match version.trim().split_once(':') {
            Some((mc, loader)) if !mc.is_empty() && !loader.is_empty() => {
                LoaderDescriptor::fabric(mc, loader)
            }
            None if !version.trim().is_empty() => LoaderDescriptor::vanilla(version.trim()),
            _ => return Err(invalid()),
        };
        Ok(Self::new(name, loader))
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub phase: InstallPhase,
    /// 0-100, or -1 when indeterminate or finished.
    pub progress: i32,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    PhaseChanged {
        name: String,
        phase: InstallPhase,
        status: String,
    },
    Progress {
        name: String,
        progress: i32,
    },
    Completed {
        name: String,
    },
    Failed {
        name: String,
        message: String,
    },
    Removed {
        name: String,
    },
}

#[derive(Default)]
struct QueueState {
    active: Option<String>,
    waiting: VecDeque<InstallRequest>,
    status: HashMap<String, InstallStatus>,
    removed: HashSet<String>,
}

impl QueueState {
    fn knows(&self, name: &str) -> bool {
        self.active.as_deref() == Some(name) || self.waiting.iter().any(|item| item.name == name)
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.waiting.is_empty()
    }
}

enum Flow {
    Completed,
    Removed,
}

/// Drives instance installs one at a time through the phase pipeline.
#[derive(Clone)]
pub struct AcquisitionScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    paths: LauncherPaths,
    settings: EngineSettings,
    metadata: Arc<dyn MetadataSource>,
    fetcher: Fetcher,
    store: InstanceStore,
    locks: LockManager,
    state: Mutex<QueueState>,
    enqueue_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SchedulerEvent>,
    idle: watch::Sender<bool>,
}

impl AcquisitionScheduler {
    pub fn new(
        settings: EngineSettings,
        metadata: Arc<dyn MetadataSource>,
        fetcher: Fetcher,
        store: InstanceStore,
        locks: LockManager,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(SchedulerInner {
                paths: store.paths().clone(),
                settings,
                metadata,
                fetcher,
                store,
                locks,
                state: Mutex::new(QueueState::default()),
                enqueue_gate: tokio::sync::Mutex::new(()),
                events,
                idle,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn progress(&self, name: &str) -> Option<i32> {
        self.state().status.get(name).map(|status| status.progress)
    }

    pub fn status(&self, name: &str) -> Option<InstallStatus> {
        self.state().status.get(name).cloned()
    }

    pub fn active(&self) -> Option<String> {
        self.state().active.clone()
    }

    pub fn queued(&self) -> Vec<String> {
        self.state()
            .waiting
            .iter()
            .map(|item| item.name.clone())
            .collect()
    }

    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Prepares the instance directory, lock and initial config, then queues
    /// the install. A name already queued or active is left alone.
    pub async fn enqueue(&self, request: InstallRequest) -> Result<()> {
        let _gate = self.inner.enqueue_gate.lock().await;
        if self.state().knows(&request.name) {
            tracing::debug!("{} is already queued", request.name);
            return Ok(());
        }

        let name = request.name.clone();
        tokio::fs::create_dir_all(self.inner.paths.instance_dir(&name)).await?;
        if !self.inner.locks.acquire(&name) {
            tracing::warn!("installing {} without holding its lock", name);
        }
        if let Err(err) = self
            .inner
            .store
            .create_or_merge(&name, request.loader.clone())
            .await
        {
            self.inner.locks.release(&name);
            return Err(err);
        }

        {
            let mut state = self.state();
            state.removed.remove(&name);
            state.waiting.push_back(request);
            state.status.insert(
                name.clone(),
                InstallStatus {
                    phase: InstallPhase::Queued,
                    progress: 0,
                },
            );
        }
        self.inner.idle.send_replace(false);
        tracing::info!("queued install of {}", name);
        self.emit(SchedulerEvent::PhaseChanged {
            name,
            phase: InstallPhase::Queued,
            status: InstallPhase::Queued.status_text().to_string(),
        });
        self.promote();
        Ok(())
    }

    /// Drops the instance from the queue and releases its lock. A transfer in
    /// flight runs to the end of its phase; no later phase starts.
    pub fn remove_from_queue(&self, name: &str) {
        self.inner.locks.release(name);
        let promote = {
            let mut state = self.state();
            state.waiting.retain(|item| item.name != name);
            state.status.remove(name);
            if state.active.as_deref() == Some(name) {
                state.removed.insert(name.to_string());
                false
            } else {
                if state.is_idle() {
                    self.inner.idle.send_replace(true);
                }
                true
            }
        };
        tracing::info!("removed {} from the download queue", name);
        self.emit(SchedulerEvent::Removed {
            name: name.to_string(),
        });
        if promote {
            self.promote();
        }
    }

    fn promote(&self) {
        let next = {
            let mut state = self.state();
            if state.active.is_some() {
                return;
            }
            match state.waiting.pop_front() {
                Some(next) => {
                    state.active = Some(next.name.clone());
                    next
                }
                None => {
                    self.inner.idle.send_replace(true);
                    return;
                }
            }
        };
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run(next).await;
        });
    }

    async fn run(&self, request: InstallRequest) {
        let name = request.name.clone();
        tracing::info!("installing {}", name);
        match self.install(&request).await {
            Ok(Flow::Completed) => {
                self.set_phase(&name, InstallPhase::Complete);
                self.set_progress(&name, -1);
                self.inner.locks.release(&name);
                tracing::info!("{} installed", name);
                self.emit(SchedulerEvent::Completed { name: name.clone() });
            }
            Ok(Flow::Removed) => {
                tracing::info!("install of {} stopped after removal", name);
            }
            Err(err) if self.was_removed(&name) => {
                tracing::info!("install of {} stopped after removal: {}", name, err);
            }
            Err(err) => {
                tracing::error!("install of {} failed: {}", name, err);
                self.set_phase(&name, InstallPhase::Failed);
                self.set_progress(&name, -1);
                self.inner.locks.release(&name);
                self.emit(SchedulerEvent::Failed {
                    name: name.clone(),
                    message: DOWNLOAD_FAILED_MESSAGE.to_string(),
                });
            }
        }
        {
            let mut state = self.state();
            state.removed.remove(&name);
            if state.active.as_deref() == Some(name.as_str()) {
                state.active = None;
            }
        }
        self.promote();
    }

    fn set_phase(&self, name: &str, phase: InstallPhase) {
        {
            let mut state = self.state();
            if !phase.is_terminal() && state.removed.contains(name) {
                return;
            }
            state
                .status
                .entry(name.to_string())
                .and_modify(|status| status.phase = phase)
                .or_insert(InstallStatus { phase, progress: 0 });
        }
        tracing::info!("{}: {}", name, phase.status_text());
        self.emit(SchedulerEvent::PhaseChanged {
            name: name.to_string(),
            phase,
            status: phase.status_text().to_string(),
        });
    }

    fn set_progress(&self, name: &str, progress: i32) {
        let changed = {
            let mut state = self.state();
            match state.status.get_mut(name) {
                Some(status) if status.progress != progress => {
                    status.progress = progress;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(SchedulerEvent::Progress {
                name: name.to_string(),
                progress,
            });
        }
    }

    fn was_removed(&self, name: &str) -> bool {
        self.state().removed.contains(name)
    }

    fn progress_callback(&self, name: &str, total: usize) -> ProgressCallback {
        let scheduler = self.clone();
        let name = name.to_string();
        Arc::new(move |done| {
            let percent = if total == 0 {
                100
            } else {
                ((done * 100) / total).min(100) as i32
            };
            scheduler.set_progress(&name, percent);
        })
    }

    async fn fetch_phase(&self, name: &str, tasks: Vec<FileTask>, granularity: usize) -> Result<()> {
        let total = tasks.len();
        self.set_progress(name, 0);
        let settings = &self.inner.settings;
        let ok = self
            .inner
            .fetcher
            .fetch_all(
                tasks,
                Some(self.progress_callback(name, total)),
                settings.concurrent_downloads,
                granularity,
            )
            .await;
        if ok {
            Ok(())
        } else {
            Err(LauncherError::Http(format!(
                "transfers for {} did not complete ({} tasks)",
                name, total
            )))
        }
    }

    async fn install(&self, request: &InstallRequest) -> Result<Flow> {
        let name = request.name.as_str();
        let paths = &self.inner.paths;
        let settings = &self.inner.settings;
        let loader = &request.loader;

        self.set_phase(name, InstallPhase::CheckingCoreFiles);
        let version: VersionManifest = manifests::parse(
            &self
                .cached_or_fetch(
                    &paths.version_json(&loader.mc_version),
                    ManifestRequest::CoreVersion {
                        mc_version: loader.mc_version.clone(),
                    },
                )
                .await?,
            "version manifest",
        )?;
        let index: AssetIndex = manifests::parse(
            &self
                .cached_or_fetch(
                    &paths.asset_index(&version.assets),
                    ManifestRequest::AssetIndex {
                        id: version.asset_index.id.clone(),
                        url: version.asset_index.url.clone(),
                    },
                )
                .await?,
            "asset index",
        )?;

        if self.was_removed(name) {
            return Ok(Flow::Removed);
        }
        self.set_phase(name, InstallPhase::DownloadingCoreFiles);
        let core = manifests::core_tasks(&version, &index, paths, &settings.resources_url);
        let archives = manifests::native_archives(&core);
        self.fetch_phase(name, core, settings.progress_granularity)
            .await?;

        tokio::time::sleep(settings.natives_delay).await;
        if self.was_removed(name) {
            return Ok(Flow::Removed);
        }
        self.set_phase(name, InstallPhase::ExtractingNatives);
        self.extract_natives(name, archives).await?;

        if self.was_removed(name) {
            return Ok(Flow::Removed);
        }
        self.set_phase(name, InstallPhase::CopyingAssets);
        self.copy_assets(name, &version, &index).await?;

        if loader.loader_type == LoaderKind::Fabric {
            if self.was_removed(name) {
                return Ok(Flow::Removed);
            }
            self.set_phase(name, InstallPhase::DownloadingLoaderFiles);
            let loader_version = loader.loader_version.clone().ok_or_else(|| {
                LauncherError::ManifestParse(format!("fabric instance {} has no loaderVersion", name))
            })?;
            let profile: LoaderProfile = manifests::parse(
                &self
                    .cached_or_fetch(
                        &paths.fabric_profile(&loader.mc_version, &loader_version),
                        ManifestRequest::LoaderProfile {
                            mc_version: loader.mc_version.clone(),
                            loader_version,
                        },
                    )
                    .await?,
                "fabric profile",
            )?;
            self.fetch_phase(
                name,
                manifests::loader_tasks(&profile, paths),
                settings.progress_granularity,
            )
            .await?;
        }

        if self.was_removed(name) {
            return Ok(Flow::Removed);
        }
        self.set_phase(name, InstallPhase::DownloadingExtraDependencies);
        self.install_extra_dependencies(name).await?;

        if self.was_removed(name) {
            return Ok(Flow::Removed);
        }
        self.inner
            .store
            .update_instance_config(name, WriteMode::Force, |_| {})
            .await?;
        Ok(Flow::Completed)
    }

    async fn install_extra_dependencies(&self, name: &str) -> Result<()> {
        let paths = &self.inner.paths;
        let record = paths.extra_dependencies_file();
        let previous: ExtraDependencies = match tokio::fs::read(&record).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => ExtraDependencies::default(),
        };
        let current: ExtraDependencies = manifests::parse(
            &self
                .inner
                .metadata
                .fetch(ManifestRequest::ExtraDependencies)
                .await?,
            "extra dependencies",
        )?;
        let tasks = manifests::extra_dependency_tasks(&current, &previous, paths, name);
        self.fetch_phase(name, tasks, 1).await?;
        write_json(&record, &serde_json::to_value(&current)?).await
    }

    /// Reads a cached manifest, fetching and caching it on a miss.
    async fn cached_or_fetch(&self, path: &Path, request: ManifestRequest) -> Result<Value> {
        if let Ok(raw) = tokio::fs::read(path).await {
            match serde_json::from_slice::<Value>(&raw) {
                Ok(value) => {
                    tracing::debug!("using cached {}", path.display());
                    return Ok(value);
                }
                Err(err) => tracing::warn!("discarding cached {}: {}", path.display(), err),
            }
        }
        let value = self.inner.metadata.fetch(request).await?;
        write_json(path, &value).await?;
        Ok(value)
    }

    async fn extract_natives(&self, name: &str, archives: Vec<PathBuf>) -> Result<()> {
        let natives_dir = self.inner.paths.instance_natives(name);
        let total = archives.len();
        self.set_progress(name, 0);
        for (position, archive) in archives.into_iter().enumerate() {
            let target = natives_dir.clone();
            tokio::task::spawn_blocking(move || extract_native_archive(&archive, &target))
                .await
                .map_err(|err| LauncherError::Config(err.to_string()))??;
            self.set_progress(name, (((position + 1) * 100) / total) as i32);
        }
        Ok(())
    }

    async fn copy_assets(
        &self,
        name: &str,
        version: &VersionManifest,
        index: &AssetIndex,
    ) -> Result<()> {
        let paths = self.inner.paths.clone();
        let mut copies: Vec<(PathBuf, PathBuf, String)> = Vec::new();
        for (key, object) in &index.objects {
            let source = paths.asset_object(&object.hash);
            if index.map_to_resources {
                copies.push((
                    source.clone(),
                    paths.instance_resource(name, key),
                    object.hash.clone(),
                ));
            }
            if manifests::uses_legacy_layout(version, index) {
                copies.push((source, paths.legacy_asset(key), object.hash.clone()));
            }
        }
        if copies.is_empty() {
            return Ok(());
        }
        let copied = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut copied = 0;
            for (source, target, hash) in copies {
                if copy_verified(&source, &target, &hash)? {
                    copied += 1;
                }
            }
            Ok(copied)
        })
        .await
        .map_err(|err| LauncherError::Config(err.to_string()))??;
        tracing::debug!("{}: copied {} assets", name, copied);
        Ok(())
    }
}

/// Returns whether a copy was made; targets that already verify are kept.
fn copy_verified(source: &Path, target: &Path, hash: &str) -> Result<bool> {
    if target.exists() && verify_file(target, hash).unwrap_or(false) {
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, target)?;
    Ok(true)
}

fn extract_native_archive(archive_path: &Path, natives_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| LauncherError::Config(err.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| LauncherError::Config(err.to_string()))?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() || name.starts_with("META-INF/") {
            continue;
        }
        let entry_path = Path::new(&name);
        if !is_safe_relative_path(entry_path) {
            continue;
        }
        let out_path = natives_dir.join(entry_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}

async fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec(value)?;
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, payload).await?;
    tokio::fs::rename(temp_path, path).await?;
    Ok(())
}
