//! Integration tests for the distributed lock
//!
//! These tests verify:
//! - Busy detection while a live record exists
//! - Stale reclaim deleting the old sentinel before writing a new one
//! - Strictly increasing `created_at` across a reclaim
//! - Polling acquisition, timeouts and guard release
//! - Remote failures: fatal on acquire, logged and swallowed on release

mod common;

use bridge_traits::time::ManualClock;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::{as_store, RecordingStore};
use core_sync::{
    sentinel_key, DistributedLock, LockIdentity, LockOperation, LockRecord, RetryPolicy, SyncError,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1))
}

fn lock_for(
    store: &Arc<RecordingStore>,
    clock: &Arc<ManualClock>,
    who: &str,
    host: &str,
) -> Arc<DistributedLock> {
    Arc::new(
        DistributedLock::new(as_store(store), fast_retry())
            .with_clock(clock.clone())
            .with_identity(LockIdentity::new(who, host)),
    )
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

#[tokio::test]
async fn test_db_lock_busy_then_stale_reclaim() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let laptop = lock_for(&store, &clock, "dev", "laptop");
    let runner = lock_for(&store, &clock, "ci", "runner-7");

    // T0: first holder gets the lock
    let first = laptop
        .acquire("db-lock", LockOperation::Upload, 10)
        .await
        .unwrap();
    assert_eq!(first.created_at, t0());
    assert_eq!(first.expires_at, t0().timestamp() + 600);

    // T0+5: still live
    clock.advance(ChronoDuration::minutes(5));
    match runner.acquire("db-lock", LockOperation::Upload, 10).await {
        Err(SyncError::LockBusy {
            name,
            holder,
            expires_at,
        }) => {
            assert_eq!(name, "db-lock");
            assert_eq!(holder, "dev@laptop");
            assert_eq!(expires_at, first.expires_at);
        }
        other => panic!("expected LockBusy, got {other:?}"),
    }

    // T0+11: stale, reclaimed
    clock.advance(ChronoDuration::minutes(6));
    store.clear_ops();
    let second = runner
        .acquire("db-lock", LockOperation::Upload, 10)
        .await
        .unwrap();

    let key = sentinel_key("db-lock");
    let ops = store.ops();
    let deleted = ops
        .iter()
        .position(|op| *op == format!("delete:{key}"))
        .expect("stale sentinel deleted");
    let written = ops
        .iter()
        .position(|op| *op == format!("put:{key}"))
        .expect("new sentinel written");
    assert!(deleted < written, "delete must precede write: {ops:?}");

    assert!(second.created_at > first.created_at);
    assert_ne!(second.lock_id, first.lock_id);

    let visible = runner.inspect("db-lock").await.unwrap().unwrap();
    assert_eq!(visible.created_by, "ci");
    assert_eq!(visible.hostname, "runner-7");
}

#[tokio::test]
async fn test_second_acquire_by_same_holder_is_busy() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "dev", "laptop");

    lock.acquire("db-lock", LockOperation::PipelineRun, 60)
        .await
        .unwrap();
    let err = lock
        .acquire("db-lock", LockOperation::PipelineRun, 60)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LockBusy { .. }));
}

#[tokio::test]
async fn test_reclaim_created_at_strictly_greater_under_skew() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::minutes(1)));
    let lock = lock_for(&store, &clock, "ci", "runner-2");

    // Written by a machine whose clock runs ten minutes ahead.
    let skewed = LockRecord {
        operation: LockOperation::Download,
        created_at: t0() + ChronoDuration::minutes(10),
        created_by: "dev".to_string(),
        hostname: "laptop".to_string(),
        timeout_minutes: 0,
        expires_at: t0().timestamp(),
        lock_id: "old".to_string(),
    };
    store
        .seed(&sentinel_key("db-lock"), &serde_json::to_vec(&skewed).unwrap())
        .await;

    let record = lock
        .acquire("db-lock", LockOperation::Download, 10)
        .await
        .unwrap();
    assert!(record.created_at > skewed.created_at);
}

#[tokio::test]
async fn test_corrupt_sentinel_is_reclaimed() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "dev", "laptop");

    store.seed(&sentinel_key("db-lock"), b"{ half written").await;
    assert!(lock.inspect("db-lock").await.unwrap().is_none());

    lock.acquire("db-lock", LockOperation::Upload, 10)
        .await
        .unwrap();
    let stored = store.read(&sentinel_key("db-lock")).await.unwrap();
    let parsed: LockRecord = serde_json::from_slice(&stored).unwrap();
    assert_eq!(parsed.created_by, "dev");
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "dev", "laptop");

    lock.acquire("db-lock", LockOperation::Upload, 10)
        .await
        .unwrap();
    lock.release("db-lock").await;
    lock.release("db-lock").await;

    assert!(lock.inspect("db-lock").await.unwrap().is_none());
    lock.acquire("db-lock", LockOperation::Upload, 10)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_polling_times_out() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let holder = lock_for(&store, &clock, "dev", "laptop");
    let waiter = lock_for(&store, &clock, "ci", "runner-1");

    holder
        .acquire("db-lock", LockOperation::Upload, 60)
        .await
        .unwrap();

    let err = waiter
        .acquire_with_polling(
            "db-lock",
            LockOperation::Upload,
            60,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::LockAcquisitionTimeout { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_polling_succeeds_after_release() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let holder = lock_for(&store, &clock, "dev", "laptop");
    let waiter = lock_for(&store, &clock, "ci", "runner-1");

    holder
        .acquire("db-lock", LockOperation::Upload, 60)
        .await
        .unwrap();

    let releaser = Arc::clone(&holder);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        releaser.release("db-lock").await;
    });

    let guard = waiter
        .acquire_with_polling(
            "db-lock",
            LockOperation::Upload,
            60,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(guard.name(), "db-lock");
    assert_eq!(guard.record().created_by, "ci");

    guard.release().await;
    assert!(waiter.inspect("db-lock").await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_guard_releases_in_background() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "dev", "laptop");

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
    drop(guard);

    for _ in 0..50 {
        if store.read(&sentinel_key("db-lock")).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sentinel still present after guard drop");
}

#[tokio::test]
async fn test_sentinel_wire_format() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "dev", "laptop");

    lock.acquire("db-lock", LockOperation::PipelineRun, 10)
        .await
        .unwrap();

    let raw: Bytes = store.read("locks/db-lock.json").await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(value["operation"], "pipeline-run");
    assert_eq!(value["created_at"], "2024-06-01T08:00:00Z");
    assert_eq!(value["created_by"], "dev");
    assert_eq!(value["hostname"], "laptop");
    assert_eq!(value["timeout_minutes"], 10);
    assert_eq!(value["expires_at"], t0().timestamp() + 600);
}

#[tokio::test]
async fn test_acquire_fails_once_stat_retries_are_exhausted() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "ci", "runner-1");
    let key = sentinel_key("db-lock");
    store.fail_transiently("stat", &key);

    let err = lock
        .acquire("db-lock", LockOperation::PipelineRun, 10)
        .await
        .unwrap_err();

    match &err {
        SyncError::MaxRetriesExceeded { attempts, last_error } => {
            assert_eq!(*attempts, 2);
            assert!(last_error.contains("503"));
        }
        other => panic!("expected MaxRetriesExceeded, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert_eq!(store.count_ops("stat", &key), 2);
    assert_eq!(store.count_ops("put", &key), 0);
}

#[tokio::test]
async fn test_acquire_fails_once_put_retries_are_exhausted() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "ci", "runner-1");
    let key = sentinel_key("db-lock");
    store.fail_transiently("put", &key);

    let err = lock
        .acquire("db-lock", LockOperation::PipelineRun, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::MaxRetriesExceeded { attempts: 2, .. }));
    assert_eq!(store.count_ops("put", &key), 2);
    assert!(store.read(&key).await.is_none());
}

#[tokio::test]
async fn test_unreadable_sentinel_fails_polling_immediately() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let holder = lock_for(&store, &clock, "dev", "laptop");
    let waiter = lock_for(&store, &clock, "ci", "runner-1");
    let key = sentinel_key("db-lock");

    holder
        .acquire("db-lock", LockOperation::Upload, 10)
        .await
        .unwrap();
    store.fail_gets_of(&key);

    let err = waiter
        .acquire_with_polling(
            "db-lock",
            LockOperation::PipelineRun,
            10,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::PermanentRemote(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn test_release_swallows_delete_failures() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let lock = lock_for(&store, &clock, "dev", "laptop");
    let key = sentinel_key("db-lock");

    lock.acquire("db-lock", LockOperation::PipelineRun, 10)
        .await
        .unwrap();
    store.fail_transiently("delete", &key);

    lock.release("db-lock").await;

    assert_eq!(store.count_ops("delete", &key), 2);
    // Left for expiry
    assert!(store.read(&key).await.is_some());
    let record = lock.inspect("db-lock").await.unwrap().unwrap();
    assert_eq!(record.created_by, "dev");
}
