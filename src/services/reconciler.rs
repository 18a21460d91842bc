use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::models::{ChangeAction, ChangeRecord};
use crate::services::instance_store::InstanceStore;
use crate::services::lock_manager::LockManager;
use crate::services::scheduler::SchedulerEvent;
use crate::services::work_queue::WorkQueue;
use crate::utils::paths::{
    classify_change, file_name_of, instance_name_of, is_instance_root, is_mod_path,
    ChangeOutcome, LEGACY_FIXER_FILE,
};

#[derive(Clone, Debug)]
struct PendingChange {
    action: ChangeAction,
    completed: bool,
    new_path: Option<PathBuf>,
}

/// Turns raw watcher batches into instance/mod mutations.
///
/// Records are tracked by absolute path until they settle. Settled records
/// are classified and their handlers run on the serialized [`WorkQueue`];
/// records touching an instance that is being installed wait for a later
/// batch.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    instances_root: PathBuf,
    store: InstanceStore,
    locks: LockManager,
    queue: WorkQueue,
    settle_delay: Duration,
    pending: Mutex<BTreeMap<PathBuf, PendingChange>>,
}

impl Reconciler {
    pub fn new(
        store: InstanceStore,
        locks: LockManager,
        queue: WorkQueue,
        settle_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                instances_root: store.paths().instances_dir(),
                store,
                locks,
                queue,
                settle_delay,
                pending: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Consumes watcher batches until the sender side closes.
    pub fn spawn(self, mut batches: mpsc::Receiver<Vec<ChangeRecord>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                self.reconcile(batch).await;
            }
            tracing::info!("watcher stream closed, reconciler stopping");
        })
    }

    /// Re-examines deferred entries whenever an install lets go of its
    /// instance lock.
    pub fn spawn_release_listener(
        self,
        mut events: broadcast::Receiver<SchedulerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(
                        SchedulerEvent::Completed { name }
                        | SchedulerEvent::Failed { name, .. }
                        | SchedulerEvent::Removed { name },
                    ) => {
                        tracing::debug!("lock on {} released, retrying deferred changes", name);
                        self.reconcile(Vec::new()).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("missed {} scheduler events", skipped);
                        self.reconcile(Vec::new()).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Processes one batch. An empty batch re-examines deferred entries.
    pub async fn reconcile(&self, batch: Vec<ChangeRecord>) {
        let inner = &self.inner;
        let root = inner.instances_root.as_path();
        let mut pending = inner.pending.lock().await;
        let mut to_settle: Vec<PathBuf> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for record in batch {
            let Some(path) = record.tracked_path() else {
                continue;
            };
            if record.action == ChangeAction::Remove {
                let vanished = pending
                    .get(&path)
                    .map(|entry| entry.action == ChangeAction::Add && !entry.completed)
                    .unwrap_or(false);
                if vanished {
                    tracing::debug!("{} vanished before settling", path.display());
                    pending.remove(&path);
                    continue;
                }
            }
            if !is_mod_path(&path, root) && !is_instance_root(&path, root) && !record.is_rename() {
                continue;
            }
            if record.action != ChangeAction::Modify && pending.contains_key(&path) {
                continue;
            }
            if file_name_of(&path).as_deref() == Some(LEGACY_FIXER_FILE) {
                continue;
            }

            if record.action != ChangeAction::Modify {
                let completed =
                    record.action != ChangeAction::Add || is_instance_root(&path, root);
                let new_path = if record.action == ChangeAction::Rename {
                    record.renamed_path()
                } else {
                    None
                };
                pending.insert(
                    path.clone(),
                    PendingChange {
                        action: record.action,
                        completed,
                        new_path,
                    },
                );
            }

            let unsettled = pending.get(&path).map(|entry| !entry.completed).unwrap_or(false);
            if unsettled
                && matches!(record.action, ChangeAction::Add | ChangeAction::Modify)
                && seen.insert(path.clone())
            {
                to_settle.push(path);
            }
        }

        let delay = inner.settle_delay;
        let checks = to_settle.into_iter().map(|path| async move {
            let settled = settle(&path, delay).await;
            (path, settled)
        });
        for (path, settled) in join_all(checks).await {
            if !settled {
                continue;
            }
            if let Some(entry) = pending.get_mut(&path) {
                entry.completed = true;
            }
        }

        drop_subsumed_mod_removals(&mut pending, root);

        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, entry)| entry.completed)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ready {
            let Some(entry) = pending.get(&path).cloned() else {
                continue;
            };
            let outcome = classify_change(entry.action, &path, entry.new_path.as_deref(), root);
            if outcome == ChangeOutcome::Ignored {
                pending.remove(&path);
                continue;
            }
            let locked = outcome
                .instances()
                .iter()
                .any(|instance| inner.locks.is_locked(instance));
            if locked {
                tracing::debug!("{} deferred: instance is being installed", path.display());
                continue;
            }
            pending.remove(&path);
            self.dispatch(outcome);
        }
    }

    fn dispatch(&self, outcome: ChangeOutcome) {
        let store = self.inner.store.clone();
        self.inner.queue.push(async move {
            if let Err(err) = apply(&store, &outcome).await {
                tracing::warn!("reconcile {:?} failed: {}", outcome, err);
            }
        });
    }
}

async fn settle(path: &Path, delay: Duration) -> bool {
    tokio::time::sleep(delay).await;
    tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .is_ok()
}

/// A completed instance removal makes pending mod removals inside it moot.
fn drop_subsumed_mod_removals(pending: &mut BTreeMap<PathBuf, PendingChange>, root: &Path) {
    let removed: HashSet<String> = pending
        .iter()
        .filter(|(path, entry)| {
            entry.completed && entry.action == ChangeAction::Remove && is_instance_root(path, root)
        })
        .filter_map(|(path, _)| instance_name_of(path, root))
        .collect();
    if removed.is_empty() {
        return;
    }
    pending.retain(|path, entry| {
        let subsumed = entry.action == ChangeAction::Remove
            && is_mod_path(path, root)
            && instance_name_of(path, root)
                .map(|name| removed.contains(&name))
                .unwrap_or(false);
        !subsumed
    });
}

async fn apply(store: &InstanceStore, outcome: &ChangeOutcome) -> crate::errors::Result<()> {
    match outcome {
        ChangeOutcome::ModAdded { instance, path } => store.handle_mod_added(instance, path).await,
        ChangeOutcome::ModRemoved {
            instance,
            file_name,
        } => store.handle_mod_removed(instance, file_name).await,
        ChangeOutcome::ModRenamed { instance, from, to } => {
            store.handle_mod_renamed(instance, from, to).await
        }
        ChangeOutcome::ModMoved {
            from_instance,
            file_name,
            to_instance,
            path,
        } => {
            store.handle_mod_removed(from_instance, file_name).await?;
            store.handle_mod_added(to_instance, path).await
        }
        ChangeOutcome::InstanceAdded { name } => store.handle_instance_added(name).await,
        ChangeOutcome::InstanceRemoved { name } => store.handle_instance_removed(name).await,
        ChangeOutcome::InstanceRenamed { from, to } => {
            store.handle_instance_renamed(from, to).await
        }
        ChangeOutcome::Ignored => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DomainEvent;
    use crate::testing::temp_root;
    use crate::utils::paths::LauncherPaths;
    use tokio::sync::broadcast;

    const VANILLA: &str = r#"{"loader": {"loaderType": "vanilla", "mcVersion": "1.20.1"}}"#;

    struct Fixture {
        paths: LauncherPaths,
        store: InstanceStore,
        locks: LockManager,
        reconciler: Reconciler,
        events: broadcast::Receiver<DomainEvent>,
    }

    async fn fixture(instances: &[(&str, &str)]) -> Fixture {
        let paths = LauncherPaths::new(temp_root("reconciler"));
        for (name, config) in instances {
            std::fs::create_dir_all(paths.instance_mods(name)).expect("create instance");
            std::fs::write(paths.instance_config(name), config).expect("seed config");
        }
        let store = InstanceStore::new(paths.clone());
        store.load_all().await.expect("load");
        let locks = LockManager::new(paths.clone(), true);
        let reconciler = Reconciler::new(store.clone(), locks.clone(), WorkQueue::new(), Duration::ZERO);
        let events = store.subscribe();
        Fixture {
            paths,
            store,
            locks,
            reconciler,
            events,
        }
    }

    fn collect(events: &mut broadcast::Receiver<DomainEvent>) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn settle_all(fixture: &mut Fixture, batch: Vec<ChangeRecord>) -> Vec<DomainEvent> {
        fixture.reconciler.reconcile(batch).await;
        fixture.reconciler.queue().wait_idle().await;
        collect(&mut fixture.events)
    }

    #[tokio::test]
    async fn repeated_notifications_yield_one_mod_added() {
        let mut fx = fixture(&[("A", VANILLA)]).await;
        let mods = fx.paths.instance_mods("A");
        std::fs::write(mods.join("x.jar"), b"jar").expect("write mod");

        let events = settle_all(
            &mut fx,
            vec![
                ChangeRecord::new(&mods, "x.jar", ChangeAction::Add),
                ChangeRecord::new(&mods, "x.jar", ChangeAction::Modify),
                ChangeRecord::new(&mods, "x.jar", ChangeAction::Add),
            ],
        )
        .await;

        assert_eq!(
            events,
            vec![DomainEvent::ModAdded {
                instance: "A".to_string(),
                file_name: "x.jar".to_string()
            }]
        );
        assert_eq!(fx.store.get("A").expect("A").mods.len(), 1);
        assert_eq!(fx.reconciler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn cross_instance_move_removes_then_adds() {
        let with_mod = r#"{"loader": {"loaderType": "vanilla", "mcVersion": "1.20.1"},
            "mods": [{"fileName": "x.jar", "displayName": "x"}]}"#;
        let mut fx = fixture(&[("A", with_mod), ("B", VANILLA)]).await;
        let from = fx.paths.instance_mods("A");
        let to = fx.paths.instance_mods("B");
        std::fs::write(to.join("x.jar"), b"jar").expect("moved mod");

        let events = settle_all(
            &mut fx,
            vec![
                ChangeRecord::rename(&from, "x.jar", &to, "x.jar"),
                ChangeRecord::new(&from, "x.jar", ChangeAction::Add),
            ],
        )
        .await;

        assert_eq!(
            events,
            vec![
                DomainEvent::ModRemoved {
                    instance: "A".to_string(),
                    file_name: "x.jar".to_string()
                },
                DomainEvent::ModAdded {
                    instance: "B".to_string(),
                    file_name: "x.jar".to_string()
                },
            ]
        );
        assert!(fx.store.get("A").expect("A").mods.is_empty());
        assert_eq!(fx.store.get("B").expect("B").mods[0].file_name, "x.jar");
    }

    #[tokio::test]
    async fn locked_instance_defers_until_released() {
        let mut fx = fixture(&[("A", VANILLA)]).await;
        let mods = fx.paths.instance_mods("A");
        std::fs::write(mods.join("x.jar"), b"jar").expect("write mod");
        assert!(fx.locks.acquire("A"));

        let events = settle_all(
            &mut fx,
            vec![ChangeRecord::new(&mods, "x.jar", ChangeAction::Add)],
        )
        .await;
        assert!(events.is_empty());
        assert_eq!(fx.reconciler.pending_len().await, 1);

        fx.locks.release("A");
        let events = settle_all(&mut fx, Vec::new()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], DomainEvent::ModAdded { instance, .. } if instance == "A"));
    }

    #[tokio::test]
    async fn finished_install_replays_deferred_changes() {
        let mut fx = fixture(&[("A", VANILLA)]).await;
        let mods = fx.paths.instance_mods("A");
        std::fs::write(mods.join("x.jar"), b"jar").expect("write mod");
        assert!(fx.locks.acquire("A"));

        let events = settle_all(
            &mut fx,
            vec![ChangeRecord::new(&mods, "x.jar", ChangeAction::Add)],
        )
        .await;
        assert!(events.is_empty());

        let (tx, rx) = broadcast::channel(8);
        let listener = fx.reconciler.clone().spawn_release_listener(rx);
        fx.locks.release("A");
        tx.send(SchedulerEvent::Completed {
            name: "A".to_string(),
        })
        .expect("listener subscribed");
        drop(tx);
        listener.await.expect("listener");
        fx.reconciler.queue().wait_idle().await;

        let events = collect(&mut fx.events);
        assert_eq!(
            events,
            vec![DomainEvent::ModAdded {
                instance: "A".to_string(),
                file_name: "x.jar".to_string()
            }]
        );
        assert_eq!(fx.reconciler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn unsettled_add_followed_by_remove_is_dropped() {
        let mut fx = fixture(&[("A", VANILLA)]).await;
        let mods = fx.paths.instance_mods("A");

        // The file never exists, so the ADD cannot settle.
        let events = settle_all(
            &mut fx,
            vec![ChangeRecord::new(&mods, "ghost.jar", ChangeAction::Add)],
        )
        .await;
        assert!(events.is_empty());
        assert_eq!(fx.reconciler.pending_len().await, 1);

        let events = settle_all(
            &mut fx,
            vec![ChangeRecord::new(&mods, "ghost.jar", ChangeAction::Remove)],
        )
        .await;
        assert!(events.is_empty());
        assert_eq!(fx.reconciler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn instance_removal_subsumes_mod_removals() {
        let with_mod = r#"{"loader": {"loaderType": "vanilla", "mcVersion": "1.20.1"},
            "mods": [{"fileName": "x.jar", "displayName": "x"}]}"#;
        let mut fx = fixture(&[("A", with_mod)]).await;
        let mods = fx.paths.instance_mods("A");
        let instances = fx.paths.instances_dir();
        std::fs::remove_dir_all(fx.paths.instance_dir("A")).expect("delete instance");

        let events = settle_all(
            &mut fx,
            vec![
                ChangeRecord::new(&mods, "x.jar", ChangeAction::Remove),
                ChangeRecord::new(&instances, "A", ChangeAction::Remove),
            ],
        )
        .await;

        assert_eq!(
            events,
            vec![DomainEvent::InstanceRemoved {
                name: "A".to_string()
            }]
        );
        assert!(!fx.store.contains("A"));
    }

    #[tokio::test]
    async fn ignores_unrelated_paths_and_legacy_fixer() {
        let mut fx = fixture(&[("A", VANILLA)]).await;
        let mods = fx.paths.instance_mods("A");
        let instance_dir = fx.paths.instance_dir("A");
        std::fs::write(mods.join(LEGACY_FIXER_FILE), b"fixer").expect("fixer");
        std::fs::write(instance_dir.join("options.txt"), b"x").expect("options");

        let events = settle_all(
            &mut fx,
            vec![
                ChangeRecord::new(&mods, LEGACY_FIXER_FILE, ChangeAction::Add),
                ChangeRecord::new(&instance_dir, "options.txt", ChangeAction::Add),
            ],
        )
        .await;
        assert!(events.is_empty());
        assert_eq!(fx.reconciler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn new_instance_directory_is_adopted() {
        let mut fx = fixture(&[]).await;
        std::fs::create_dir_all(fx.paths.instance_dir("fresh")).expect("mkdir");
        std::fs::write(fx.paths.instance_config("fresh"), VANILLA).expect("config");
        let instances = fx.paths.instances_dir();

        let events = settle_all(
            &mut fx,
            vec![ChangeRecord::new(&instances, "fresh", ChangeAction::Add)],
        )
        .await;
        assert_eq!(
            events,
            vec![DomainEvent::InstanceAdded {
                name: "fresh".to_string()
            }]
        );
        assert!(fx.store.contains("fresh"));
    }
}
