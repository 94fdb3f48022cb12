//! Integration tests for database snapshot sync
//!
//! These tests verify:
//! - Hash-equal snapshots are never transferred
//! - Pull replaces the local file atomically and is idempotent
//! - Push uploads only on mismatch
//! - Both conflict paths keep the losing snapshot under a backup key

mod common;

use bridge_traits::storage::sha256_hex;
use common::{as_store, RecordingStore};
use core_sync::{
    DatabaseSyncService, DistributedLock, LockGuard, LockOperation, RetryPolicy, SyncAction,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DB_KEY: &str = "db/archive.sqlite";

struct Fixture {
    _dir: TempDir,
    store: Arc<RecordingStore>,
    sync: DatabaseSyncService,
    guard: LockGuard,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::new());
        let retry = RetryPolicy::new(2, Duration::from_millis(1));

        let lock = Arc::new(DistributedLock::new(as_store(&store), retry.clone()));
        let guard = lock
            .acquire_with_polling(
                "db-lock",
                LockOperation::PipelineRun,
                60,
                Duration::from_millis(10),
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        let sync = DatabaseSyncService::new(
            as_store(&store),
            retry,
            dir.path().join("data").join("archive.sqlite"),
            DB_KEY,
        );

        Self {
            _dir: dir,
            store,
            sync,
            guard,
        }
    }

    fn write_local(&self, bytes: &[u8]) {
        let path = self.sync.local_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn read_local(&self) -> Vec<u8> {
        std::fs::read(self.sync.local_path()).unwrap()
    }
}

#[tokio::test]
async fn test_pull_equal_hashes_is_no_op() {
    let fx = Fixture::new().await;
    fx.write_local(b"abc");
    fx.store.seed(DB_KEY, b"abc").await;
    fx.store.clear_ops();

    let outcome = fx.sync.pull(&fx.guard).await.unwrap();

    assert_eq!(outcome.action_taken, SyncAction::NoOp);
    assert_eq!(outcome.local_hash, Some(sha256_hex(b"abc")));
    assert_eq!(outcome.local_hash, outcome.remote_hash);
    assert!(
        !fx.store.ops().iter().any(|op| op.starts_with("get:")),
        "no download expected: {:?}",
        fx.store.ops()
    );
}

#[tokio::test]
async fn test_pull_mismatch_downloads_and_is_idempotent() {
    let fx = Fixture::new().await;
    fx.write_local(b"abc");
    fx.store.seed(DB_KEY, b"xyz").await;

    let outcome = fx.sync.pull(&fx.guard).await.unwrap();
    assert_eq!(outcome.action_taken, SyncAction::Pulled);
    assert_eq!(outcome.local_hash, Some(sha256_hex(b"abc")));
    assert_eq!(outcome.remote_hash, Some(sha256_hex(b"xyz")));

    assert_eq!(fx.read_local(), b"xyz");
    assert_eq!(fx.sync.local_hash().await.unwrap(), Some(sha256_hex(b"xyz")));

    let leftovers: Vec<_> = std::fs::read_dir(fx.sync.local_path().parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "temp files left behind: {leftovers:?}");

    let again = fx.sync.pull(&fx.guard).await.unwrap();
    assert_eq!(again.action_taken, SyncAction::NoOp);
}

#[tokio::test]
async fn test_pull_without_local_file() {
    let fx = Fixture::new().await;
    fx.store.seed(DB_KEY, b"remote").await;

    let outcome = fx.sync.pull(&fx.guard).await.unwrap();
    assert_eq!(outcome.action_taken, SyncAction::Pulled);
    assert_eq!(outcome.local_hash, None);
    assert_eq!(fx.read_local(), b"remote");
}

#[tokio::test]
async fn test_pull_without_remote_is_no_op() {
    let fx = Fixture::new().await;
    fx.write_local(b"local only");

    let outcome = fx.sync.pull(&fx.guard).await.unwrap();
    assert_eq!(outcome.action_taken, SyncAction::NoOp);
    assert_eq!(outcome.remote_hash, None);
    assert_eq!(fx.read_local(), b"local only");
}

#[tokio::test]
async fn test_push_uploads_on_mismatch_only() {
    let fx = Fixture::new().await;
    fx.write_local(b"new");
    fx.store.seed(DB_KEY, b"old").await;

    let outcome = fx.sync.push(&fx.guard).await.unwrap();
    assert_eq!(outcome.action_taken, SyncAction::Pushed);
    assert_eq!(outcome.local_hash, Some(sha256_hex(b"new")));
    assert_eq!(outcome.remote_hash, Some(sha256_hex(b"old")));
    assert!(outcome.backup_key.is_none());
    assert!(outcome.conflict.is_none());
    assert_eq!(fx.store.read(DB_KEY).await.unwrap().as_ref(), b"new");

    fx.store.clear_ops();
    let again = fx.sync.push(&fx.guard).await.unwrap();
    assert_eq!(again.action_taken, SyncAction::NoOp);
    assert!(!fx.store.ops().iter().any(|op| op.starts_with("put:")));
}

#[tokio::test]
async fn test_push_without_local_file_is_no_op() {
    let fx = Fixture::new().await;
    fx.store.seed(DB_KEY, b"remote").await;

    let outcome = fx.sync.push(&fx.guard).await.unwrap();
    assert_eq!(outcome.action_taken, SyncAction::NoOp);
    assert_eq!(outcome.local_hash, None);
    assert_eq!(fx.store.read(DB_KEY).await.unwrap().as_ref(), b"remote");
}

#[tokio::test]
async fn test_push_backs_up_remote_that_drifted_before_upload() {
    let fx = Fixture::new().await;
    fx.write_local(b"mine");
    fx.store.seed(DB_KEY, b"base").await;
    // First stat is the pre-flight check, second is the re-check before upload.
    fx.store.overwrite_before_stat(DB_KEY, 2, b"theirs");

    let outcome = fx.sync.push(&fx.guard).await.unwrap();

    assert_eq!(outcome.action_taken, SyncAction::ConflictResolved);
    assert_eq!(outcome.remote_hash, Some(sha256_hex(b"theirs")));
    let conflict = outcome.conflict.clone().expect("conflict description");
    assert!(conflict.contains(DB_KEY));
    assert!(conflict.contains(&format!("expected remote {}", sha256_hex(b"base"))));
    assert!(conflict.contains(&format!("found {}", sha256_hex(b"theirs"))));
    let backup = outcome.backup_key.expect("backup key");
    assert!(backup.starts_with("db/backups/archive.sqlite."));
    assert!(backup.ends_with(&sha256_hex(b"theirs")[..12]));
    assert_eq!(fx.store.read(&backup).await.unwrap().as_ref(), b"theirs");
    assert_eq!(fx.store.read(DB_KEY).await.unwrap().as_ref(), b"mine");

    assert_eq!(fx.sync.list_backups().await.unwrap(), vec![backup]);
}

#[tokio::test]
async fn test_push_backs_up_local_when_later_push_wins() {
    let fx = Fixture::new().await;
    fx.write_local(b"mine");
    fx.store.seed(DB_KEY, b"base").await;
    fx.store.overwrite_after_put(DB_KEY, b"later");

    let outcome = fx.sync.push(&fx.guard).await.unwrap();

    assert_eq!(outcome.action_taken, SyncAction::ConflictResolved);
    let conflict = outcome.conflict.clone().expect("conflict description");
    assert!(conflict.contains(&format!("expected remote {}", sha256_hex(b"mine"))));
    assert!(conflict.contains(&format!("found {}", sha256_hex(b"later"))));
    let backup = outcome.backup_key.expect("backup key");
    assert!(backup.ends_with(&sha256_hex(b"mine")[..12]));
    assert_eq!(fx.store.read(&backup).await.unwrap().as_ref(), b"mine");
    assert_eq!(fx.store.read(DB_KEY).await.unwrap().as_ref(), b"later");
}
