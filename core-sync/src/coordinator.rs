//! # Pipeline Coordinator
//!
//! Top-level entry point for one pipeline run.
//!
//! ## Overview
//!
//! The coordinator wraps the job orchestrator between a database pull and a
//! database push, all inside the distributed database lock:
//!
//! ```text
//! Idle → LockAcquired → Pulled → Processing → Pushed → Idle
//!            └──────────────┴──────────┴──────────┴──→ Failed
//! ```
//!
//! ## Workflow
//!
//! 1. Acquire the lock, polling until the configured wait timeout
//! 2. Pull the database snapshot; a failure here aborts before any job runs
//! 3. Run the orchestrator until done, the item limit, or cancellation
//! 4. Push the database snapshot; also attempted after a processing failure
//!    as long as at least one job completed
//! 5. Release the lock on every path
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coordinator = PipelineCoordinator::from_config(&config, store, progress, downloader, uploader);
//! let report = coordinator.run(jobs, cancel).await?;
//! std::process::exit(report.exit_code(config.workers.failed_job_threshold));
//! ```

use crate::db_sync::{DatabaseSyncService, SyncOutcome};
use crate::job::JobItem;
use crate::lock::{DistributedLock, LockGuard, LockIdentity, LockOperation};
use crate::orchestrator::{JobOrchestrator, OrchestratorConfig};
use crate::progress::ProgressStore;
use crate::retry::RetryPolicy;
use crate::stats::RunStats;
use crate::{Result, SyncError};
use bridge_traits::storage::ObjectStore;
use bridge_traits::transfer::{Downloader, Uploader};
use core_runtime::config::{LockSettings, PipelineConfig};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Where a pipeline run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    LockAcquired,
    Pulled,
    Processing,
    Pushed,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::LockAcquired => "lock_acquired",
            PipelineState::Pulled => "pulled",
            PipelineState::Processing => "processing",
            PipelineState::Pushed => "pushed",
            PipelineState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, to: PipelineState) -> bool {
        matches!(
            (self, to),
            (PipelineState::Idle, PipelineState::LockAcquired)
                | (PipelineState::LockAcquired, PipelineState::Pulled)
                | (PipelineState::Pulled, PipelineState::Processing)
                | (PipelineState::Processing, PipelineState::Pushed)
                | (PipelineState::Pushed, PipelineState::Idle)
                | (PipelineState::Failed, PipelineState::Idle)
                | (_, PipelineState::Failed)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lock parameters for a run
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lock_name: String,
    pub lock_timeout_minutes: u64,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    pub operation: LockOperation,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_name: "db-lock".to_string(),
            lock_timeout_minutes: 60,
            poll_interval: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(30 * 60),
            operation: LockOperation::PipelineRun,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            lock_name: settings.name.clone(),
            lock_timeout_minutes: settings.timeout_minutes,
            poll_interval: settings.poll_interval,
            wait_timeout: settings.wait_timeout,
            operation: LockOperation::PipelineRun,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub pull: Option<SyncOutcome>,
    pub push: Option<SyncOutcome>,
    pub stats: Option<RunStats>,
    /// Every state the run went through, in order
    pub states: Vec<PipelineState>,
}

impl PipelineReport {
    /// 0 on success, 4 when terminally failed jobs exceed `failed_job_threshold`.
    pub fn exit_code(&self, failed_job_threshold: Option<u64>) -> i32 {
        match (failed_job_threshold, &self.stats) {
            (Some(threshold), Some(stats)) if stats.failed > threshold => 4,
            _ => 0,
        }
    }
}

/// Lock, pull, process, push, release.
pub struct PipelineCoordinator {
    lock: Arc<DistributedLock>,
    sync: DatabaseSyncService,
    orchestrator: JobOrchestrator,
    config: CoordinatorConfig,
    state: RwLock<PipelineState>,
}

impl PipelineCoordinator {
    pub fn new(
        lock: Arc<DistributedLock>,
        sync: DatabaseSyncService,
        orchestrator: JobOrchestrator,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            lock,
            sync,
            orchestrator,
            config,
            state: RwLock::new(PipelineState::Idle),
        }
    }

    /// Wire every component from a loaded [`PipelineConfig`].
    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<dyn ObjectStore>,
        progress: Arc<dyn ProgressStore>,
        downloader: Arc<dyn Downloader>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);

        let lock = Arc::new(
            DistributedLock::new(Arc::clone(&store), retry.clone())
                .with_identity(LockIdentity::from_settings(&config.lock)),
        );
        let sync = DatabaseSyncService::new(
            store,
            retry.clone(),
            config.database_path.clone(),
            config.remote_database_key.clone(),
        )
        .with_backup_prefix(config.backup_prefix.clone());
        let orchestrator = JobOrchestrator::new(
            progress,
            downloader,
            uploader,
            retry,
            OrchestratorConfig::from_settings(&config.workers),
        );

        Self::new(
            lock,
            sync,
            orchestrator,
            CoordinatorConfig::from_settings(&config.lock),
        )
    }

    pub fn state(&self) -> PipelineState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn enter(&self, to: PipelineState, report: &mut PipelineReport) -> Result<()> {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: state.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: "Pipeline steps must run in order".to_string(),
            });
        }
        *state = to;
        report.states.push(to);
        Ok(())
    }

    fn fail(&self, report: &mut PipelineReport) {
        let _ = self.enter(PipelineState::Failed, report);
    }

    /// Run the whole pipeline once.
    ///
    /// # Errors
    ///
    /// - [`SyncError::LockAcquisitionTimeout`] before anything was touched
    /// - pull/push failures
    /// - [`SyncError::RunAborted`] if job processing stopped on a progress
    ///   store failure (after pushing whatever completed)
    /// - [`SyncError::Cancelled`] if cancelled while waiting for the lock
    #[instrument(skip(self, jobs, cancel), fields(lock = %self.config.lock_name, jobs = jobs.len()))]
    pub async fn run(&self, jobs: Vec<JobItem>, cancel: CancellationToken) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !matches!(*state, PipelineState::Idle | PipelineState::Failed) {
                return Err(SyncError::InvalidStateTransition {
                    from: state.as_str().to_string(),
                    to: PipelineState::LockAcquired.as_str().to_string(),
                    reason: "A run is already in progress".to_string(),
                });
            }
            *state = PipelineState::Idle;
        }
        report.states.push(PipelineState::Idle);

        // Phase 1: lock
        info!("Phase 1: Acquiring database lock");
        let acquired = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            acquired = self.lock.acquire_with_polling(
                &self.config.lock_name,
                self.config.operation,
                self.config.lock_timeout_minutes,
                self.config.poll_interval,
                self.config.wait_timeout,
            ) => acquired,
        };
        let guard = match acquired {
            Ok(guard) => guard,
            Err(e) => {
                error!(error = %e, "Could not acquire database lock");
                self.fail(&mut report);
                return Err(e);
            }
        };
        self.enter(PipelineState::LockAcquired, &mut report)?;

        let outcome = self.run_locked(&guard, jobs, cancel, &mut report).await;

        // Phase 5: release
        info!("Phase 5: Releasing database lock");
        guard.release().await;

        match outcome {
            Ok(()) => {
                self.enter(PipelineState::Idle, &mut report)?;
                info!(
                    pull = ?report.pull.as_ref().map(|o| o.action_taken),
                    push = ?report.push.as_ref().map(|o| o.action_taken),
                    done = report.stats.as_ref().map(|s| s.done).unwrap_or(0),
                    failed = report.stats.as_ref().map(|s| s.failed).unwrap_or(0),
                    "Pipeline run complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.fail(&mut report);
                error!(error = %e, states = ?report.states, "Pipeline run failed");
                Err(e)
            }
        }
    }

    async fn run_locked(
        &self,
        guard: &LockGuard,
        jobs: Vec<JobItem>,
        cancel: CancellationToken,
        report: &mut PipelineReport,
    ) -> Result<()> {
        // Phase 2: pull
        info!("Phase 2: Pulling database snapshot");
        let pull = self.sync.pull(guard).await?;
        report.pull = Some(pull);
        self.enter(PipelineState::Pulled, report)?;

        // Phase 3: process
        info!("Phase 3: Processing jobs");
        self.enter(PipelineState::Processing, report)?;
        let processing = self.orchestrator.run_configured(jobs, cancel).await;

        let deferred_error = match processing {
            Ok(stats) => {
                report.stats = Some(stats);
                None
            }
            Err(SyncError::RunAborted { completed, source }) if completed > 0 => {
                warn!(
                    completed,
                    error = %source,
                    "Job processing aborted, pushing completed work"
                );
                Some(SyncError::RunAborted { completed, source })
            }
            Err(e) => return Err(e),
        };

        // Phase 4: push
        info!("Phase 4: Pushing database snapshot");
        let push = self.sync.push(guard).await?;
        report.push = Some(push);
        self.enter(PipelineState::Pushed, report)?;

        match deferred_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
