use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::{LauncherError, Result};
use crate::services::fetcher::{ByteStream, DownloadSource};
use crate::services::metadata::{ManifestRequest, MetadataSource};

pub fn temp_root(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("launcher-sync-{}-{}", label, Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp root");
    dir
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// In-memory transport that counts every `open`.
pub struct MemorySource {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, usize>>,
    opens: Mutex<HashMap<String, usize>>,
    held: Mutex<HashSet<String>>,
    released: watch::Sender<bool>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self {
            bodies: Mutex::default(),
            failures: Mutex::default(),
            opens: Mutex::default(),
            held: Mutex::default(),
            released: watch::channel(false).0,
        }
    }
}

impl MemorySource {
    pub fn insert(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    /// The next `times` opens of `url` fail.
    pub fn fail_times(&self, url: &str, times: usize) {
        self.failures.lock().unwrap().insert(url.to_string(), times);
    }

    /// Opens of `url` block until [`MemorySource::release`].
    pub fn hold(&self, url: &str) {
        self.held.lock().unwrap().insert(url.to_string());
    }

    pub fn release(&self) {
        self.released.send_replace(true);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().values().sum()
    }

    pub fn opens_for(&self, url: &str) -> usize {
        self.opens.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DownloadSource for MemorySource {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        *self.opens.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let held = self.held.lock().unwrap().contains(url);
        if held {
            let mut released = self.released.subscribe();
            let _ = released.wait_for(|released| *released).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LauncherError::Http(format!("{} -> injected failure", url)));
                }
            }
        }

        let body = self.bodies.lock().unwrap().get(url).cloned();
        let Some(body) = body else {
            return Err(LauncherError::Http(format!("{} -> HTTP 404", url)));
        };
        let middle = body.len() / 2;
        let chunks = vec![body[..middle].to_vec(), body[middle..].to_vec()];
        Ok(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

#[derive(Default)]
pub struct StaticMetadata {
    documents: Mutex<HashMap<ManifestRequest, Value>>,
    fetches: AtomicUsize,
}

impl StaticMetadata {
    pub fn insert(&self, request: ManifestRequest, document: Value) {
        self.documents.lock().unwrap().insert(request, document);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn fetch(&self, request: ManifestRequest) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.documents
            .lock()
            .unwrap()
            .get(&request)
            .cloned()
            .ok_or_else(|| LauncherError::NotFound(request.describe()))
    }
}
