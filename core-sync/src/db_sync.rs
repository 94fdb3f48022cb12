//! # Database Sync
//!
//! Whole-file synchronisation of the shared database snapshot.
//!
//! ## Overview
//!
//! The local database file and its remote copy are compared by SHA-256. A
//! transfer happens only when the digests differ:
//!
//! - [`pull`](DatabaseSyncService::pull) downloads the remote snapshot into a
//!   temp file next to the local one and renames it into place.
//! - [`push`](DatabaseSyncService::push) uploads the local snapshot. The remote
//!   hash is re-read just before and just after the upload; any drift means
//!   another writer got in, and the losing snapshot is copied under
//!   `{backup_prefix}/{name}.{timestamp}.{hash12}` instead of being discarded.
//!
//! Both operations take a [`LockGuard`] so they can only be called while the
//! database lock is held.

use crate::lock::LockGuard;
use crate::progress::write_atomic;
use crate::retry::RetryPolicy;
use crate::{Result, SyncError};
use bridge_traits::storage::{sha256_hex, ObjectMetadata, ObjectStore, HASH_METADATA_KEY};
use bridge_traits::time::{Clock, SystemClock};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

const HASH_CHUNK: usize = 64 * 1024;

/// What a sync pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncAction {
    NoOp,
    Pulled,
    Pushed,
    ConflictResolved,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::NoOp => "no-op",
            SyncAction::Pulled => "pulled",
            SyncAction::Pushed => "pushed",
            SyncAction::ConflictResolved => "conflict-resolved",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one pull or push.
///
/// `local_hash == remote_hash` (both present) always implies `NoOp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Local digest before the pass, `None` if there was no local file
    pub local_hash: Option<String>,
    /// Remote digest the pass compared against (for a pull, the digest of
    /// what was written), `None` if there was no remote object
    pub remote_hash: Option<String>,
    pub action_taken: SyncAction,
    /// Where the losing snapshot went, for `ConflictResolved`
    pub backup_key: Option<String>,
    /// The [`SyncError::SyncConflict`] that was resolved, rendered
    pub conflict: Option<String>,
}

impl SyncOutcome {
    fn no_op(local_hash: Option<String>, remote_hash: Option<String>) -> Self {
        Self {
            local_hash,
            remote_hash,
            action_taken: SyncAction::NoOp,
            backup_key: None,
            conflict: None,
        }
    }
}

/// Keeps the local database file and its remote snapshot in step.
pub struct DatabaseSyncService {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    local_path: PathBuf,
    remote_key: String,
    backup_prefix: String,
}

impl DatabaseSyncService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry,
            clock: Arc::new(SystemClock),
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            backup_prefix: "db/backups".to_string(),
        }
    }

    pub fn with_backup_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.backup_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    /// Streaming SHA-256 of the local file, `None` if it does not exist.
    pub async fn local_hash(&self) -> Result<Option<String>> {
        let mut file = match tokio::fs::File::open(&self.local_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// Digest of the remote snapshot without downloading it when the store
    /// carries the hash in its metadata.
    pub async fn remote_hash(&self) -> Result<Option<String>> {
        let stat = self
            .retry
            .call(|| self.store.stat(&self.remote_key))
            .await?;

        match stat {
            None => Ok(None),
            Some(stat) => match stat.hash {
                Some(hash) => Ok(Some(hash)),
                None => {
                    warn!(key = %self.remote_key, "Remote snapshot has no recorded hash, downloading to compute it");
                    let bytes = self.retry.call(|| self.store.get(&self.remote_key)).await?;
                    Ok(Some(sha256_hex(&bytes)))
                }
            },
        }
    }

    /// Bring the local file up to date with the remote snapshot.
    #[instrument(skip(self, guard), fields(lock = %guard.name(), key = %self.remote_key))]
    pub async fn pull(&self, guard: &LockGuard) -> Result<SyncOutcome> {
        self.check_guard(guard);

        let local_hash = self.local_hash().await?;
        let remote_hash = self.remote_hash().await?;

        let Some(expected) = remote_hash.clone() else {
            info!(local = ?local_hash, "No remote snapshot, nothing to pull");
            return Ok(SyncOutcome::no_op(local_hash, None));
        };

        if local_hash.as_deref() == Some(expected.as_str()) {
            info!(hash = %expected, "Local snapshot is current");
            return Ok(SyncOutcome::no_op(local_hash, remote_hash));
        }

        let bytes = self.retry.call(|| self.store.get(&self.remote_key)).await?;
        let written = sha256_hex(&bytes);
        if written != expected {
            warn!(
                expected = %expected,
                downloaded = %written,
                "Remote snapshot changed while pulling"
            );
        }

        write_atomic(&self.local_path, &bytes).await?;

        info!(
            from = ?local_hash,
            to = %written,
            bytes = bytes.len(),
            "Pulled remote snapshot"
        );
        Ok(SyncOutcome {
            local_hash,
            remote_hash: Some(written),
            action_taken: SyncAction::Pulled,
            backup_key: None,
            conflict: None,
        })
    }

    /// Publish the local file as the remote snapshot.
    #[instrument(skip(self, guard), fields(lock = %guard.name(), key = %self.remote_key))]
    pub async fn push(&self, guard: &LockGuard) -> Result<SyncOutcome> {
        self.check_guard(guard);

        let bytes = match tokio::fs::read(&self.local_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.local_path.display(), "No local snapshot, nothing to push");
                let remote_hash = self.remote_hash().await?;
                return Ok(SyncOutcome::no_op(None, remote_hash));
            }
            Err(e) => return Err(e.into()),
        };
        let local = sha256_hex(&bytes);
        let preflight = self.remote_hash().await?;

        if preflight.as_deref() == Some(local.as_str()) {
            info!(hash = %local, "Remote snapshot is current");
            return Ok(SyncOutcome::no_op(Some(local), preflight));
        }

        let mut backup_key = None;
        let mut conflict = None;

        let before_upload = self.remote_hash().await?;
        if before_upload.as_deref() == Some(local.as_str()) {
            info!(hash = %local, "Remote snapshot caught up before upload");
            return Ok(SyncOutcome::no_op(Some(local), before_upload));
        }
        if before_upload != preflight {
            if let Some(drifted) = before_upload.as_deref() {
                let detected = SyncError::SyncConflict {
                    key: self.remote_key.clone(),
                    expected: preflight.clone().unwrap_or_else(|| "absent".to_string()),
                    found: drifted.to_string(),
                };
                warn!(conflict = %detected, "Remote snapshot changed before upload, backing it up");
                let remote_bytes = self.retry.call(|| self.store.get(&self.remote_key)).await?;
                backup_key = Some(self.write_backup(remote_bytes, drifted).await?);
                conflict = Some(detected.to_string());
            }
        }

        let mut metadata = ObjectMetadata::new();
        metadata.insert(HASH_METADATA_KEY.to_string(), local.clone());
        self.retry
            .call(|| self.store.put(&self.remote_key, bytes.clone(), metadata.clone()))
            .await?;

        let after_upload = self.remote_hash().await?;
        if after_upload.as_deref() != Some(local.as_str()) {
            let detected = SyncError::SyncConflict {
                key: self.remote_key.clone(),
                expected: local.clone(),
                found: after_upload.clone().unwrap_or_else(|| "absent".to_string()),
            };
            warn!(conflict = %detected, "Another push landed after ours, backing up local snapshot");
            backup_key = Some(self.write_backup(bytes.clone(), &local).await?);
            conflict = Some(detected.to_string());
        }

        let action_taken = if backup_key.is_some() {
            SyncAction::ConflictResolved
        } else {
            SyncAction::Pushed
        };

        info!(
            hash = %local,
            previous = ?preflight,
            bytes = bytes.len(),
            action = %action_taken,
            "Pushed local snapshot"
        );
        Ok(SyncOutcome {
            local_hash: Some(local),
            remote_hash: before_upload,
            action_taken,
            backup_key,
            conflict,
        })
    }

    /// Backup keys for this snapshot, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/{}.", self.backup_prefix, self.snapshot_name());
        let mut keys = self.retry.call(|| self.store.list(&prefix)).await?;
        keys.retain(|k| k.starts_with(&prefix));
        keys.sort();
        Ok(keys)
    }

    fn snapshot_name(&self) -> &str {
        self.remote_key
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("snapshot")
    }

    fn backup_key_for(&self, hash: &str) -> String {
        let stamp = self.clock.now().format("%Y%m%dT%H%M%SZ");
        let short = &hash[..hash.len().min(12)];
        format!(
            "{}/{}.{}.{}",
            self.backup_prefix,
            self.snapshot_name(),
            stamp,
            short
        )
    }

    async fn write_backup(&self, bytes: Bytes, hash: &str) -> Result<String> {
        let key = self.backup_key_for(hash);
        let mut metadata = ObjectMetadata::new();
        metadata.insert(HASH_METADATA_KEY.to_string(), hash.to_string());
        self.retry
            .call(|| self.store.put(&key, bytes.clone(), metadata.clone()))
            .await?;
        info!(backup = %key, "Stored losing snapshot");
        Ok(key)
    }

    fn check_guard(&self, guard: &LockGuard) {
        if guard.record().is_expired_at(self.clock.now()) {
            warn!(
                lock = %guard.name(),
                expires_at = guard.record().expires_at,
                "Lock has expired while still in use"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::MemoryObjectStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> DatabaseSyncService {
        DatabaseSyncService::new(
            Arc::new(MemoryObjectStore::new()),
            RetryPolicy::default(),
            dir.path().join("archive.sqlite"),
            "db/archive.sqlite",
        )
    }

    #[tokio::test]
    async fn test_local_hash_absent_and_present() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        assert_eq!(svc.local_hash().await.unwrap(), None);

        std::fs::write(svc.local_path(), b"abc").unwrap();
        assert_eq!(svc.local_hash().await.unwrap(), Some(sha256_hex(b"abc")));
    }

    #[test]
    fn test_backup_key_layout() {
        let dir = TempDir::new().unwrap();
        let clock = bridge_traits::time::ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
        );
        let svc = service(&dir)
            .with_backup_prefix("db/backups/")
            .with_clock(Arc::new(clock));

        let key = svc.backup_key_for("0123456789abcdef0123");
        assert_eq!(key, "db/backups/archive.sqlite.20240506T070809Z.0123456789ab");
    }

    #[test]
    fn test_action_names() {
        assert_eq!(
            serde_json::to_value(SyncAction::ConflictResolved).unwrap(),
            "conflict-resolved"
        );
        assert_eq!(serde_json::to_value(SyncAction::NoOp).unwrap(), "no-op");
    }
}
