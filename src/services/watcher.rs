use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;

use crate::errors::{LauncherError, Result};
use crate::models::{ChangeAction, ChangeRecord};

pub const BATCH_CAPACITY: usize = 64;

/// Window in which the two halves of a rename are paired into one event.
const DEBOUNCE_TIMEOUT: Duration = Duration::from_millis(50);

type NotifyDebouncer = Debouncer<notify::RecommendedWatcher, RecommendedCache>;

/// OS-level filesystem watcher producing raw change batches.
pub trait WatchService: Send + Sync {
    fn start_watching(&self, root: &Path) -> Result<mpsc::Receiver<Vec<ChangeRecord>>>;
}

#[derive(Default)]
pub struct NotifyWatcher {
    debouncers: Mutex<Vec<NotifyDebouncer>>,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatchService for NotifyWatcher {
    fn start_watching(&self, root: &Path) -> Result<mpsc::Receiver<Vec<ChangeRecord>>> {
        let (tx, rx) = mpsc::channel(BATCH_CAPACITY);
        let mut debouncer = new_debouncer(
            DEBOUNCE_TIMEOUT,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let batch: Vec<ChangeRecord> = events
                        .iter()
                        .flat_map(|debounced| convert_event(&debounced.event))
                        .collect();
                    if batch.is_empty() {
                        return;
                    }
                    // Runs on the debouncer thread; blocks while the reconciler is behind.
                    if tx.blocking_send(batch).is_err() {
                        tracing::debug!("change batch dropped, reconciler is gone");
                    }
                }
                Err(errors) => {
                    for err in errors {
                        tracing::warn!("file watcher error: {}", err);
                    }
                }
            },
        )
        .map_err(|err| LauncherError::Config(format!("cannot create watcher: {}", err)))?;
        debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| {
                LauncherError::Config(format!("cannot watch {}: {}", root.display(), err))
            })?;
        tracing::info!("watching {}", root.display());

        let mut debouncers = match self.debouncers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debouncers.push(debouncer);
        Ok(rx)
    }
}

fn record_for(path: &Path, action: ChangeAction) -> Option<ChangeRecord> {
    let directory = path.parent()?;
    let file = path.file_name()?.to_str()?;
    Some(ChangeRecord::new(directory, file, action))
}

fn rename_record(old: &Path, new: &Path) -> Option<ChangeRecord> {
    Some(ChangeRecord::rename(
        old.parent()?,
        old.file_name()?.to_str()?,
        new.parent()?,
        new.file_name()?.to_str()?,
    ))
}

/// Maps one notify event to change records.
pub fn convert_event(event: &notify::Event) -> Vec<ChangeRecord> {
    let action = match &event.kind {
        EventKind::Create(_) => ChangeAction::Add,
        EventKind::Remove(_) => ChangeAction::Remove,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let (Some(old), Some(new)) = (event.paths.first(), event.paths.get(1)) else {
                return Vec::new();
            };
            return rename_record(old, new).into_iter().collect();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeAction::Remove,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeAction::Add,
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .iter()
                .filter_map(|path| {
                    let action = if path.exists() {
                        ChangeAction::Add
                    } else {
                        ChangeAction::Remove
                    };
                    record_for(path, action)
                })
                .collect();
        }
        EventKind::Modify(_) => ChangeAction::Modify,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter_map(|path| record_for(path, action))
        .collect()
}
