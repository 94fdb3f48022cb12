//! Shared fakes for the core-sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_desktop::MemoryObjectStore;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{ObjectMetadata, ObjectStat, ObjectStore},
    transfer::{Downloader, Uploader},
};
use bytes::Bytes;
use core_sync::{InMemoryProgressStore, JobItem, ProgressMap, ProgressStore, SyncError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Object store
// ============================================================================

/// Memory store that records every call and can simulate competing writers.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryObjectStore,
    ops: Mutex<Vec<String>>,
    stat_counts: Mutex<HashMap<String, usize>>,
    /// (key, nth stat, bytes): overwrite `key` right before its nth stat
    overwrite_before_stat: Mutex<Option<(String, usize, Bytes)>>,
    /// (key, bytes): overwrite `key` right after our next put to it
    overwrite_after_put: Mutex<Option<(String, Bytes)>>,
    failing_gets: Mutex<HashSet<String>>,
    /// "op:key" pairs that always fail with a retryable error
    transient_failures: Mutex<HashSet<String>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn overwrite_before_stat(&self, key: &str, nth: usize, bytes: &[u8]) {
        *self.overwrite_before_stat.lock().unwrap() =
            Some((key.to_string(), nth, Bytes::copy_from_slice(bytes)));
    }

    pub fn overwrite_after_put(&self, key: &str, bytes: &[u8]) {
        *self.overwrite_after_put.lock().unwrap() =
            Some((key.to_string(), Bytes::copy_from_slice(bytes)));
    }

    pub fn fail_gets_of(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    /// Make every `op` ("stat", "get", "put" or "delete") on `key` fail with
    /// a retryable error.
    pub fn fail_transiently(&self, op: &str, key: &str) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(format!("{op}:{key}"));
    }

    pub fn count_ops(&self, op: &str, key: &str) -> usize {
        let wanted = format!("{op}:{key}");
        self.ops().iter().filter(|o| **o == wanted).count()
    }

    /// Write without recording, as another machine would.
    pub async fn seed(&self, key: &str, bytes: &[u8]) {
        self.inner
            .put(key, Bytes::copy_from_slice(bytes), ObjectMetadata::new())
            .await
            .unwrap();
    }

    pub async fn read(&self, key: &str) -> Option<Bytes> {
        self.inner.get(key).await.ok()
    }

    fn log(&self, op: &str, key: &str) {
        self.ops.lock().unwrap().push(format!("{op}:{key}"));
    }

    fn check(&self, op: &str, key: &str) -> Result<()> {
        if self
            .transient_failures
            .lock()
            .unwrap()
            .contains(&format!("{op}:{key}"))
        {
            return Err(BridgeError::Transient(format!("HTTP 503 ({op} {key})")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> Result<()> {
        self.log("put", key);
        self.check("put", key)?;
        self.inner.put(key, data, metadata).await?;

        let pending = {
            let mut hook = self.overwrite_after_put.lock().unwrap();
            match hook.as_ref() {
                Some((target, _)) if target == key => hook.take(),
                _ => None,
            }
        };
        if let Some((_, bytes)) = pending {
            self.inner.put(key, bytes, ObjectMetadata::new()).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.log("get", key);
        self.check("get", key)?;
        if self.failing_gets.lock().unwrap().contains(key) {
            return Err(BridgeError::Permanent(format!("HTTP 403 ({key})")));
        }
        self.inner.get(key).await
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>> {
        self.log("stat", key);
        self.check("stat", key)?;
        let count = {
            let mut counts = self.stat_counts.lock().unwrap();
            let count = counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let pending = {
            let mut hook = self.overwrite_before_stat.lock().unwrap();
            match hook.as_ref() {
                Some((target, nth, _)) if target == key && *nth == count => hook.take(),
                _ => None,
            }
        };
        if let Some((_, _, bytes)) = pending {
            self.inner.put(key, bytes, ObjectMetadata::new()).await?;
        }

        self.inner.stat(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.log("delete", key);
        self.check("delete", key)?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.log("list", prefix);
        self.inner.list(prefix).await
    }
}

// ============================================================================
// Transfer collaborators
// ============================================================================

/// Tracks how many calls are running at once.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Downloader writing `<key>.bin` files into a directory.
pub struct FakeDownloader {
    dir: PathBuf,
    delay: Duration,
    pub gauge: ConcurrencyGauge,
    calls: Mutex<Vec<String>>,
    permanent_failures: HashSet<String>,
    transient_failures: HashSet<String>,
}

impl FakeDownloader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            delay: Duration::from_millis(0),
            gauge: ConcurrencyGauge::default(),
            calls: Mutex::new(Vec::new()),
            permanent_failures: HashSet::new(),
            transient_failures: HashSet::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_permanently(mut self, key: &str) -> Self {
        self.permanent_failures.insert(key.to_string());
        self
    }

    pub fn failing_transiently(mut self, key: &str) -> Self {
        self.transient_failures.insert(key.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls().iter().filter(|k| k.as_str() == key).count()
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, key: &str, _metadata: &HashMap<String, String>) -> Result<PathBuf> {
        self.calls.lock().unwrap().push(key.to_string());
        self.gauge.enter();
        tokio::time::sleep(self.delay).await;
        self.gauge.exit();

        if self.permanent_failures.contains(key) {
            return Err(BridgeError::NotFound(key.to_string()));
        }
        if self.transient_failures.contains(key) {
            return Err(BridgeError::Transient(format!("HTTP 503 ({key})")));
        }

        let path = self.dir.join(format!("{}.bin", key.replace('/', "_")));
        tokio::fs::write(&path, key.as_bytes()).await?;
        Ok(path)
    }
}

/// Uploader recording what it archived.
#[derive(Default)]
pub struct FakeUploader {
    pub gauge: ConcurrencyGauge,
    archived: Mutex<Vec<PathBuf>>,
}

impl FakeUploader {
    pub fn archived(&self) -> Vec<PathBuf> {
        self.archived.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn archive(&self, local_path: &Path, _metadata: &HashMap<String, String>) -> Result<String> {
        self.gauge.enter();
        tokio::task::yield_now().await;
        self.gauge.exit();

        if !local_path.exists() {
            return Err(BridgeError::Permanent(format!(
                "{} does not exist",
                local_path.display()
            )));
        }
        self.archived.lock().unwrap().push(local_path.to_path_buf());
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("documents/{name}"))
    }
}

// ============================================================================
// Progress store
// ============================================================================

/// In-memory progress store whose upserts start failing after `ok_upserts`.
pub struct FlakyProgressStore {
    inner: InMemoryProgressStore,
    ok_upserts: usize,
    upserts: AtomicUsize,
}

impl FlakyProgressStore {
    pub fn new(ok_upserts: usize) -> Self {
        Self {
            inner: InMemoryProgressStore::new(),
            ok_upserts,
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> ProgressMap {
        self.inner.snapshot()
    }
}

#[async_trait]
impl ProgressStore for FlakyProgressStore {
    async fn load(&self) -> core_sync::Result<ProgressMap> {
        self.inner.load().await
    }

    async fn save(&self, items: &ProgressMap) -> core_sync::Result<()> {
        self.inner.save(items).await
    }

    async fn upsert(&self, item: &JobItem) -> core_sync::Result<()> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) >= self.ok_upserts {
            return Err(SyncError::Progress("disk full".to_string()));
        }
        self.inner.upsert(item).await
    }

    async fn compact(&self) -> core_sync::Result<usize> {
        self.inner.compact().await
    }
}

pub fn download_jobs(n: usize) -> Vec<JobItem> {
    (0..n).map(|i| JobItem::download(format!("doc-{i:02}"))).collect()
}

pub fn as_store(store: &Arc<RecordingStore>) -> Arc<dyn ObjectStore> {
    Arc::clone(store) as Arc<dyn ObjectStore>
}
