use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    /// The first job after an idle period began running.
    Started,
    Executed { remaining: usize },
    Drained,
}

/// Runs pushed jobs one at a time, in push order, on a single worker task.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<watch::Sender<usize>>,
    events: broadcast::Sender<QueueEvent>,
}

impl WorkQueue {
    /// Must be called from inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let (pending, _) = watch::channel(0_usize);
        let pending = Arc::new(pending);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tokio::spawn(run_worker(rx, pending.clone(), events.clone()));
        Self {
            tx,
            pending,
            events,
        }
    }

    pub fn push<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.send_modify(|count| *count += 1);
        if self.tx.send(Box::pin(job)).is_err() {
            self.pending.send_modify(|count| *count = count.saturating_sub(1));
            tracing::error!("work queue worker is gone, job dropped");
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    pending: Arc<watch::Sender<usize>>,
    events: broadcast::Sender<QueueEvent>,
) {
    let mut running = false;
    while let Some(job) = rx.recv().await {
        if !running {
            running = true;
            let _ = events.send(QueueEvent::Started);
        }
        // A panicking job must not take the worker down with it.
        if let Err(err) = tokio::spawn(job).await {
            tracing::error!("work queue job panicked: {}", err);
        }
        // Events go out before the count drops so `wait_idle` observers see them.
        let remaining = pending.borrow().saturating_sub(1);
        let _ = events.send(QueueEvent::Executed { remaining });
        if remaining == 0 {
            running = false;
            let _ = events.send(QueueEvent::Drained);
        }
        pending.send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_jobs_in_push_order() {
        let queue = WorkQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..5_u64 {
            let order = order.clone();
            queue.push(async move {
                tokio::time::sleep(Duration::from_millis(5 * (5 - index))).await;
                order.lock().expect("order lock").push(index);
            });
        }
        queue.wait_idle().await;
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn emits_lifecycle_events_and_survives_panics() {
        let queue = WorkQueue::new();
        let mut events = queue.subscribe();
        queue.push(async { panic!("boom") });
        queue.push(async {});
        queue.wait_idle().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                QueueEvent::Started,
                QueueEvent::Executed { remaining: 1 },
                QueueEvent::Executed { remaining: 0 },
                QueueEvent::Drained,
            ]
        );
    }
}
