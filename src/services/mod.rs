pub mod fetcher;
pub mod instance_store;
pub mod lock_manager;
pub mod manifests;
pub mod metadata;
pub mod reconciler;
pub mod scheduler;
pub mod watcher;
pub mod work_queue;

pub use fetcher::{DownloadSource, Fetcher, HttpSource, RetryPolicy};
pub use instance_store::InstanceStore;
pub use lock_manager::LockManager;
pub use metadata::{HttpMetadataSource, ManifestRequest, MetadataSource};
pub use reconciler::Reconciler;
pub use scheduler::{AcquisitionScheduler, InstallRequest, InstallStatus, SchedulerEvent};
pub use watcher::{NotifyWatcher, WatchService};
pub use work_queue::{QueueEvent, WorkQueue};
