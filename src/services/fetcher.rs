use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::errors::{LauncherError, Result};
use crate::models::FileTask;
use crate::utils::hash::verify_file_async;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;
pub type ProgressCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Transport the fetcher pulls bytes from.
#[async_trait]
pub trait DownloadSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream>;
}

#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(settings: &EngineSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .connect_timeout(settings.http_connect_timeout)
            .pool_max_idle_per_host((settings.concurrent_downloads * 2).clamp(4, 128))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DownloadSource for HttpSource {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::Http(format!("{} -> HTTP {}", url, status)));
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(LauncherError::from))
            .boxed())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            wait: settings.retry_wait,
        }
    }
}

/// Bounded-concurrency downloader. Each task is retried independently; the
/// aggregate result is `true` only when every task succeeded.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn DownloadSource>,
    retry: RetryPolicy,
}

enum TaskResult {
    Done,
    Failed { destination: PathBuf },
}

impl Fetcher {
    pub fn new(source: Arc<dyn DownloadSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub async fn fetch_all(
        &self,
        tasks: Vec<FileTask>,
        on_progress: Option<ProgressCallback>,
        concurrency: usize,
        progress_granularity: usize,
    ) -> bool {
        let total = tasks.len();
        if total == 0 {
            return true;
        }
        let granularity = progress_granularity.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<TaskResult>(256);

        for task in tasks {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let retry = self.retry;

            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                let ok = run_task(source.as_ref(), &task, retry).await;
                let result = if ok {
                    TaskResult::Done
                } else {
                    TaskResult::Failed {
                        destination: task.destination.clone(),
                    }
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        // Counted here rather than in the tasks so reported values only grow.
        let mut done = 0_usize;
        let mut failed = 0_usize;
        while let Some(result) = rx.recv().await {
            done += 1;
            if let Some(callback) = on_progress.as_ref() {
                if done % granularity == 0 || done == total {
                    callback(done);
                }
            }
            if let TaskResult::Failed { destination } = result {
                failed += 1;
                tracing::error!("download permanently failed: {}", destination.display());
            }
        }
        if failed > 0 {
            tracing::warn!("{} of {} transfers failed", failed, total);
        }
        failed == 0
    }
}

async fn run_task(source: &dyn DownloadSource, task: &FileTask, retry: RetryPolicy) -> bool {
    let Some(url) = task.source_url.as_deref() else {
        if task.destination.exists() {
            if let Err(err) = tokio::fs::remove_file(&task.destination).await {
                tracing::warn!("remove {} failed: {}", task.destination.display(), err);
            }
        } else {
            tracing::debug!("skipping task without source: {}", task.destination.display());
        }
        return true;
    };

    for attempt in 1..=retry.max_attempts {
        if attempt > 1 {
            sleep(retry.wait).await;
        }
        match download_task(source, url, task).await {
            Ok(()) => return true,
            Err(err) => {
                tracing::warn!(
                    "{} -> {} [attempt {}/{}]",
                    url,
                    err,
                    attempt,
                    retry.max_attempts
                );
            }
        }
    }
    false
}

async fn already_present(task: &FileTask) -> bool {
    if !task.destination.exists() {
        return false;
    }
    if let Some(mirror) = task.legacy_mirror.as_ref() {
        if !mirror.exists() {
            return false;
        }
    }
    // Without a digest there is nothing to prove the file is current.
    let Some(expected) = task.expected_hash.as_deref() else {
        return false;
    };
    let mut targets = vec![task.destination.as_path()];
    targets.extend(task.legacy_mirror.as_deref());
    for target in targets {
        match verify_file_async(target, expected).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("hash mismatch, refetching {}", target.display());
                return false;
            }
            Err(err) => {
                tracing::debug!("cannot verify {}: {}", target.display(), err);
                return false;
            }
        }
    }
    true
}

fn part_path(target: &Path, token: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!("{}.{}.part", name, token))
}

async fn open_sink(target: &Path, token: &str) -> Result<(tokio::fs::File, PathBuf)> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(target, token);
    let file = tokio::fs::File::create(&part).await?;
    Ok((file, part))
}

async fn download_task(source: &dyn DownloadSource, url: &str, task: &FileTask) -> Result<()> {
    if already_present(task).await {
        return Ok(());
    }

    let token = Uuid::new_v4().simple().to_string();
    let (mut primary, primary_part) = open_sink(&task.destination, &token).await?;
    let mut mirror = match task.legacy_mirror.as_deref() {
        Some(target) => match open_sink(target, &token).await {
            Ok(sink) => Some((sink, target)),
            Err(err) => {
                drop(primary);
                let _ = tokio::fs::remove_file(&primary_part).await;
                return Err(err);
            }
        },
        None => None,
    };

    let streamed = async {
        let mut stream = source.open(url).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            primary.write_all(&chunk).await?;
            if let Some(((sink, _), _)) = mirror.as_mut() {
                sink.write_all(&chunk).await?;
            }
        }
        primary.flush().await?;
        primary.sync_all().await?;
        if let Some(((sink, _), _)) = mirror.as_mut() {
            sink.flush().await?;
            sink.sync_all().await?;
        }
        Ok::<(), LauncherError>(())
    }
    .await;

    drop(primary);
    let mirror = mirror.map(|((sink, part), target)| {
        drop(sink);
        (part, target.to_path_buf())
    });

    if let Err(err) = streamed {
        let _ = tokio::fs::remove_file(&primary_part).await;
        if let Some((part, _)) = mirror.as_ref() {
            let _ = tokio::fs::remove_file(part).await;
        }
        return Err(err);
    }

    tokio::fs::rename(&primary_part, &task.destination).await?;
    if let Some((part, target)) = mirror {
        tokio::fs::rename(&part, &target).await?;
    }
    Ok(())
}
