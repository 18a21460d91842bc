use launcher_sync::config::EngineSettings;
use launcher_sync::errors::Result;
use launcher_sync::services::{
    InstallRequest, NotifyWatcher, QueueEvent, SchedulerEvent, WatchService,
};
use launcher_sync::utils::paths::{resolve_log_dir, resolve_root_dir, LauncherPaths};
use launcher_sync::{build_state, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let root = resolve_root_dir();
    // Initialize logging as early as possible so setup failures are recorded.
    logging::init(&resolve_log_dir(&root))?;

    let settings = EngineSettings::from_env();
    tracing::info!("data root {}", root.display());
    let state = build_state(LauncherPaths::new(root), settings)?;
    state.store.load_all().await?;

    let watcher = NotifyWatcher::new();
    let batches = watcher.start_watching(&state.paths.instances_dir())?;
    let reconciler_task = state.reconciler.clone().spawn(batches);
    let release_task = state
        .reconciler
        .clone()
        .spawn_release_listener(state.scheduler.subscribe());

    let mut queue_events = state.reconciler.queue().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = queue_events.recv().await {
            match event {
                QueueEvent::Started => tracing::info!("synchronizing mods"),
                QueueEvent::Executed { remaining } => {
                    tracing::debug!("synchronizing mods, {} left", remaining)
                }
                QueueEvent::Drained => tracing::info!("mods synchronized"),
            }
        }
    });

    let mut scheduler_events = state.scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = scheduler_events.recv().await {
            match event {
                SchedulerEvent::Failed { name, message } => {
                    tracing::error!("{}: {}", name, message)
                }
                SchedulerEvent::Completed { name } => tracing::info!("{} is ready", name),
                _ => tracing::debug!("{:?}", event),
            }
        }
    });

    for arg in std::env::args().skip(1) {
        match arg.parse::<InstallRequest>() {
            Ok(request) => state.scheduler.enqueue(request).await?,
            Err(err) => tracing::warn!("ignoring argument: {}", err),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    drop(watcher);
    reconciler_task.abort();
    release_task.abort();
    Ok(())
}
