pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::config::EngineSettings;
use crate::errors::Result;
use crate::services::{
    AcquisitionScheduler, Fetcher, HttpMetadataSource, HttpSource, InstanceStore, LockManager,
    Reconciler, RetryPolicy, WorkQueue,
};
use crate::utils::paths::LauncherPaths;

/// Every long-lived service of the engine, wired together.
#[derive(Clone)]
pub struct AppState {
    pub settings: EngineSettings,
    pub paths: LauncherPaths,
    pub store: InstanceStore,
    pub locks: LockManager,
    pub scheduler: AcquisitionScheduler,
    pub reconciler: Reconciler,
}

/// Builds the production service graph over `paths`. Must run inside a tokio
/// runtime.
pub fn build_state(paths: LauncherPaths, settings: EngineSettings) -> Result<AppState> {
    std::fs::create_dir_all(paths.instances_dir())?;
    std::fs::create_dir_all(paths.datastore_dir())?;

    let store = InstanceStore::new(paths.clone());
    let locks = LockManager::new(paths.clone(), settings.lock_stale_check);
    let source = Arc::new(HttpSource::new(&settings)?);
    let fetcher = Fetcher::new(source, RetryPolicy::from_settings(&settings));
    let metadata = Arc::new(HttpMetadataSource::new(&settings)?);
    let scheduler = AcquisitionScheduler::new(
        settings.clone(),
        metadata,
        fetcher,
        store.clone(),
        locks.clone(),
    );
    let reconciler = Reconciler::new(
        store.clone(),
        locks.clone(),
        WorkQueue::new(),
        settings.settle_delay,
    );

    Ok(AppState {
        settings,
        paths,
        store,
        locks,
        scheduler,
        reconciler,
    })
}
