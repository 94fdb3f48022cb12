//! # Distributed Lock
//!
//! Advisory mutual exclusion between machines that only share an object store.
//!
//! ## Overview
//!
//! A lock named `db-lock` is represented by the sentinel object
//! `locks/db-lock.json` holding a [`LockRecord`]. Acquisition reads the
//! sentinel; if it is absent a new record is written, if it is present and
//! expired (or unreadable) it is deleted and acquisition is retried once, and
//! otherwise [`SyncError::LockBusy`] is returned. After writing, the sentinel
//! is read back and its `lock_id` compared so that a contender whose write was
//! overwritten learns about it immediately.
//!
//! The store offers no compare-and-swap, so two contenders that both observe
//! "absent" can still both write. The hash checks in the database sync are the
//! safety net for that window.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let lock = Arc::new(DistributedLock::new(store, RetryPolicy::default()));
//! let guard = lock
//!     .acquire_with_polling("db-lock", LockOperation::PipelineRun, 60, poll, wait)
//!     .await?;
//! // ... critical section ...
//! guard.release().await;
//! ```

use crate::retry::RetryPolicy;
use crate::{Result, SyncError};
use bridge_traits::storage::{ObjectMetadata, ObjectStore};
use bridge_traits::time::{Clock, SystemClock};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_runtime::config::LockSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Prefix under which all lock sentinels live.
pub const LOCK_PREFIX: &str = "locks";

/// Object key of the sentinel for lock `name`.
pub fn sentinel_key(name: &str) -> String {
    format!("{}/{}.json", LOCK_PREFIX, name)
}

// ============================================================================
// Records
// ============================================================================

/// What the holder is doing inside the critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockOperation {
    Upload,
    Download,
    PipelineRun,
}

impl LockOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockOperation::Upload => "upload",
            LockOperation::Download => "download",
            LockOperation::PipelineRun => "pipeline-run",
        }
    }
}

impl std::fmt::Display for LockOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contents of a lock sentinel object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub operation: LockOperation,
    /// Acquisition time, ISO-8601
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub hostname: String,
    pub timeout_minutes: u64,
    /// `created_at + timeout_minutes`, epoch seconds
    pub expires_at: i64,
    /// Random per-acquisition identifier used for read-back verification
    #[serde(default)]
    pub lock_id: String,
}

impl LockRecord {
    /// Holder description for diagnostics.
    pub fn holder(&self) -> String {
        format!("{}@{}", self.created_by, self.hostname)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expires_at
    }
}

/// Who is asking for the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockIdentity {
    pub created_by: String,
    pub hostname: String,
}

impl LockIdentity {
    pub fn new(created_by: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            hostname: hostname.into(),
        }
    }

    /// Identity from the process environment (`USER`, `HOSTNAME`).
    pub fn detect() -> Self {
        let created_by = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self::new(created_by, hostname)
    }

    /// Configured holder name if any, otherwise [`detect`](Self::detect).
    pub fn from_settings(settings: &LockSettings) -> Self {
        let detected = Self::detect();
        match &settings.holder {
            Some(holder) => Self::new(holder.clone(), detected.hostname),
            None => detected,
        }
    }
}

enum Sentinel {
    Absent,
    Held(LockRecord),
    Corrupt(String),
}

// ============================================================================
// Lock
// ============================================================================

/// Advisory lock over sentinel objects in an [`ObjectStore`].
pub struct DistributedLock {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    identity: LockIdentity,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            clock: Arc::new(SystemClock),
            identity: LockIdentity::detect(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_identity(mut self, identity: LockIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    /// True iff the current time is past `record.expires_at`.
    pub fn is_stale(&self, record: &LockRecord) -> bool {
        record.is_expired_at(self.clock.now())
    }

    /// Current holder of `name`, if any. Unreadable sentinels report `None`.
    pub async fn inspect(&self, name: &str) -> Result<Option<LockRecord>> {
        match self.read_sentinel(&sentinel_key(name)).await? {
            Sentinel::Held(record) => Ok(Some(record)),
            Sentinel::Absent | Sentinel::Corrupt(_) => Ok(None),
        }
    }

    /// Try once to take lock `name`.
    ///
    /// A stale or unreadable sentinel is deleted first and acquisition is
    /// retried once.
    ///
    /// # Errors
    ///
    /// - [`SyncError::LockBusy`] if a live record is held by someone else
    /// - remote errors once the retry policy gives up
    #[instrument(skip(self), fields(holder = %self.identity.created_by))]
    pub async fn acquire(
        &self,
        name: &str,
        operation: LockOperation,
        timeout_minutes: u64,
    ) -> Result<LockRecord> {
        let key = sentinel_key(name);
        let mut reclaimed_after: Option<DateTime<Utc>> = None;

        for _ in 0..2 {
            match self.read_sentinel(&key).await? {
                Sentinel::Absent => {
                    return self
                        .write_record(name, &key, operation, timeout_minutes, reclaimed_after)
                        .await;
                }
                Sentinel::Held(record) if self.is_stale(&record) => {
                    if reclaimed_after.is_some() {
                        break;
                    }
                    info!(
                        lock = name,
                        stale_holder = %record.holder(),
                        expired_at = record.expires_at,
                        "Reclaiming stale lock"
                    );
                    self.delete_sentinel(&key).await?;
                    reclaimed_after = Some(record.created_at);
                }
                Sentinel::Held(record) => {
                    debug!(lock = name, holder = %record.holder(), "Lock is busy");
                    return Err(busy(name, &record));
                }
                Sentinel::Corrupt(reason) => {
                    if reclaimed_after.is_some() {
                        break;
                    }
                    warn!(lock = name, reason = %reason, "Reclaiming unreadable lock sentinel");
                    self.delete_sentinel(&key).await?;
                    reclaimed_after = Some(DateTime::<Utc>::MIN_UTC);
                }
            }
        }

        // A third party took the lock between our delete and re-read.
        match self.read_sentinel(&key).await? {
            Sentinel::Held(record) => Err(busy(name, &record)),
            _ => Err(SyncError::LockBusy {
                name: name.to_string(),
                holder: "unknown".to_string(),
                expires_at: 0,
            }),
        }
    }

    /// Delete the sentinel for `name`. Idempotent; failures are logged, not returned.
    #[instrument(skip(self))]
    pub async fn release(&self, name: &str) {
        let key = sentinel_key(name);
        match self.retry.call(|| self.store.delete(&key)).await {
            Ok(()) => info!(lock = name, "Lock released"),
            Err(e) => warn!(lock = name, error = %e, "Failed to release lock; it will expire"),
        }
    }

    /// Acquire `name`, polling every `poll_interval` while it is busy.
    ///
    /// # Errors
    ///
    /// [`SyncError::LockAcquisitionTimeout`] once `wait_timeout` has elapsed
    /// without acquiring. Other errors propagate immediately.
    pub async fn acquire_with_polling(
        self: &Arc<Self>,
        name: &str,
        operation: LockOperation,
        timeout_minutes: u64,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Result<LockGuard> {
        let started = tokio::time::Instant::now();

        loop {
            match self.acquire(name, operation, timeout_minutes).await {
                Ok(record) => {
                    return Ok(LockGuard {
                        lock: Arc::clone(self),
                        name: name.to_string(),
                        record,
                        released: false,
                    });
                }
                Err(SyncError::LockBusy {
                    holder, expires_at, ..
                }) => {
                    let waited = started.elapsed();
                    if waited >= wait_timeout {
                        warn!(
                            lock = name,
                            holder = %holder,
                            waited_secs = waited.as_secs(),
                            "Gave up waiting for lock"
                        );
                        return Err(SyncError::LockAcquisitionTimeout {
                            name: name.to_string(),
                            waited_secs: waited.as_secs(),
                        });
                    }
                    let pause = poll_interval.min(wait_timeout - waited);
                    info!(
                        lock = name,
                        holder = %holder,
                        expires_at,
                        retry_in_ms = pause.as_millis() as u64,
                        "Lock busy, waiting"
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_sentinel(&self, key: &str) -> Result<Sentinel> {
        let stat = self.retry.call(|| self.store.stat(key)).await?;
        if stat.is_none() {
            return Ok(Sentinel::Absent);
        }

        let bytes = match self.retry.call(|| self.store.get(key)).await {
            Ok(bytes) => bytes,
            // Deleted between stat and get
            Err(e) if e.inner().is_not_found() => return Ok(Sentinel::Absent),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) => Ok(Sentinel::Held(record)),
            Err(e) => Ok(Sentinel::Corrupt(e.to_string())),
        }
    }

    async fn delete_sentinel(&self, key: &str) -> Result<()> {
        self.retry.call(|| self.store.delete(key)).await?;
        Ok(())
    }

    async fn write_record(
        &self,
        name: &str,
        key: &str,
        operation: LockOperation,
        timeout_minutes: u64,
        reclaimed_after: Option<DateTime<Utc>>,
    ) -> Result<LockRecord> {
        let mut created_at = self.clock.now();
        if let Some(previous) = reclaimed_after {
            if created_at <= previous {
                created_at = previous + ChronoDuration::seconds(1);
            }
        }

        let timeout_secs = i64::try_from(timeout_minutes.saturating_mul(60)).unwrap_or(i64::MAX);
        let record = LockRecord {
            operation,
            created_at,
            created_by: self.identity.created_by.clone(),
            hostname: self.identity.hostname.clone(),
            timeout_minutes,
            expires_at: created_at.timestamp().saturating_add(timeout_secs),
            lock_id: Uuid::new_v4().to_string(),
        };

        let body = Bytes::from(serde_json::to_vec(&record)?);
        self.retry
            .call(|| self.store.put(key, body.clone(), ObjectMetadata::new()))
            .await?;

        match self.read_sentinel(key).await? {
            Sentinel::Held(visible) if visible.lock_id != record.lock_id => {
                warn!(
                    lock = name,
                    winner = %visible.holder(),
                    "Lost acquisition race"
                );
                return Err(busy(name, &visible));
            }
            Sentinel::Held(_) => {}
            Sentinel::Absent | Sentinel::Corrupt(_) => {
                warn!(lock = name, "Lock sentinel not visible after write");
            }
        }

        info!(
            lock = name,
            operation = %operation,
            expires_at = record.expires_at,
            lock_id = %record.lock_id,
            "Lock acquired"
        );
        Ok(record)
    }
}

fn busy(name: &str, record: &LockRecord) -> SyncError {
    SyncError::LockBusy {
        name: name.to_string(),
        holder: record.holder(),
        expires_at: record.expires_at,
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Proof that a lock is held.
///
/// Call [`release`](Self::release) on every exit path. A guard dropped
/// without release schedules a best-effort release on the current runtime.
pub struct LockGuard {
    lock: Arc<DistributedLock>,
    name: String,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub async fn release(mut self) {
        self.released = true;
        self.lock.release(&self.name).await;
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("record", &self.record)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let lock = Arc::clone(&self.lock);
        let name = self.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock = %name, "Lock guard dropped without release; releasing in background");
                handle.spawn(async move {
                    lock.release(&name).await;
                });
            }
            Err(_) => {
                warn!(lock = %name, "Lock guard dropped outside a runtime; lock will expire");
            }
        }
    }
}
