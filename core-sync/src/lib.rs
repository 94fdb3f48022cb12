//! # Pipeline Synchronisation Core
//!
//! Coordinates bulk document work across machines that share one database file
//! through an object store.
//!
//! ## Overview
//!
//! This crate contains everything between the object store and the binary:
//! - Acquiring an advisory lock built on sentinel objects
//! - Pulling and pushing the shared database snapshot by content hash
//! - Running download/upload jobs through bounded worker pools
//! - Persisting job progress so interrupted runs resume
//!
//! ## Components
//!
//! - **Retry Policy** (`retry`): Exponential backoff with jitter for every remote call
//! - **Distributed Lock** (`lock`): Sentinel-object mutual exclusion with stale reclaim
//! - **Database Sync** (`db_sync`): Hash-compared pull/push with conflict backups
//! - **Job State Machine** (`job`): Validated job transitions
//! - **Progress Store** (`progress`): Snapshot + journal ledger of job states
//! - **Job Orchestrator** (`orchestrator`): Separate download and upload worker pools
//! - **Pipeline Coordinator** (`coordinator`): Lock, pull, process, push, release

pub mod coordinator;
pub mod db_sync;
pub mod error;
pub mod job;
pub mod lock;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod stats;

pub use coordinator::{CoordinatorConfig, PipelineCoordinator, PipelineReport, PipelineState};
pub use db_sync::{DatabaseSyncService, SyncAction, SyncOutcome};
pub use error::{Result, SyncError};
pub use job::{JobItem, JobKind, JobState};
pub use lock::{sentinel_key, DistributedLock, LockGuard, LockIdentity, LockOperation, LockRecord};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig, WorkerPool, ARCHIVE_KEY_PREFIX};
pub use progress::{InMemoryProgressStore, JsonFileProgressStore, ProgressMap, ProgressStore};
pub use retry::{RetryError, RetryPolicy};
pub use stats::{DurationSummary, PoolStats, RunStats};
