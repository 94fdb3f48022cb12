//! # Job Orchestrator
//!
//! Drives thousands of download/upload jobs through two bounded worker pools.
//!
//! ## Overview
//!
//! Downloads and uploads talk to different endpoints with different rate
//! limits, so each kind gets its own [`WorkerPool`] with its own concurrency
//! ceiling and its own bounded queue. A slow archive store therefore cannot
//! starve the document source, and the other way round.
//!
//! For every job a worker:
//! 1. claims it (`pending → in_flight`, one attempt) and persists the claim
//! 2. calls the downloader or uploader through the [`RetryPolicy`]
//! 3. marks it `done`, or records the failure (`pending` again below the
//!    attempt ceiling, `failed` at it) and persists the result
//!
//! Runs are resumable: jobs already `done` or terminally `failed` in the
//! progress store are skipped, and pending jobs left in the store by an
//! earlier run are picked up even when the caller does not list them again.
//!
//! ## Cancellation
//!
//! Cancelling the token stops the feeders and stops workers from claiming new
//! jobs. A job already claimed always runs to completion and is persisted.
//! A progress store failure cancels the run the same way and is reported as
//! [`SyncError::RunAborted`] once in-flight work has drained.

use crate::job::{JobItem, JobKind, JobState};
use crate::progress::ProgressStore;
use crate::retry::RetryPolicy;
use crate::stats::{RunStats, StatsCollector};
use crate::{Result, SyncError};
use bridge_traits::error::BridgeError;
use bridge_traits::transfer::{Downloader, Uploader};
use core_runtime::config::WorkerSettings;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Key prefix of upload jobs created by chaining a finished download.
pub const ARCHIVE_KEY_PREFIX: &str = "archive:";

/// Metadata entry recording where an upload landed.
pub const ARCHIVED_AS_METADATA_KEY: &str = "remote_key";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workers in the download pool
    pub download_concurrency: usize,
    /// Workers in the upload pool
    pub upload_concurrency: usize,
    /// Total claims a job gets. `attempts` counts the claim in progress, so
    /// a job whose `max_job_attempts`-th claim fails is marked `failed`
    /// right away; it does not wait for `attempts` to exceed this value.
    pub max_job_attempts: u32,
    /// Maximum number of queued jobs to start in one run
    pub item_limit: Option<usize>,
    /// Queue an `archive:<key>` upload for every finished download
    pub chain_uploads: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 3,
            upload_concurrency: 2,
            max_job_attempts: 3,
            item_limit: None,
            chain_uploads: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            download_concurrency: settings.download_concurrency,
            upload_concurrency: settings.upload_concurrency,
            max_job_attempts: settings.max_job_attempts,
            item_limit: settings.item_limit,
            chain_uploads: settings.chain_uploads,
        }
    }
}

// ============================================================================
// Worker pools
// ============================================================================

/// A fixed number of workers draining one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    kind: JobKind,
    concurrency: usize,
}

impl WorkerPool {
    /// A concurrency of zero is raised to one.
    pub fn new(kind: JobKind, concurrency: usize) -> Self {
        Self {
            kind,
            concurrency: concurrency.max(1),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn queue_capacity(&self) -> usize {
        self.concurrency * 2
    }

    fn spawn(
        &self,
        ctx: Arc<RunContext>,
        rx: mpsc::Receiver<JobItem>,
        chain: Option<mpsc::Sender<JobItem>>,
    ) -> RunningPool {
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();

        for worker_id in 0..self.concurrency {
            let ctx = Arc::clone(&ctx);
            let rx = Arc::clone(&rx);
            let chain = chain.clone();
            let kind = self.kind;
            workers.spawn(async move {
                worker_loop(kind, worker_id, ctx, rx, chain).await;
            });
        }

        debug!(pool = %self.kind, workers = self.concurrency, "Worker pool started");
        RunningPool {
            kind: self.kind,
            workers,
            rx,
        }
    }
}

struct RunningPool {
    kind: JobKind,
    workers: JoinSet<()>,
    rx: Arc<Mutex<mpsc::Receiver<JobItem>>>,
}

impl RunningPool {
    /// Wait for every worker, then count jobs left in the queue.
    async fn join(mut self, ctx: &RunContext) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(pool = %self.kind, error = %e, "Worker task failed");
            }
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut left = 0;
        while rx.try_recv().is_ok() {
            left += 1;
        }
        if left > 0 {
            ctx.not_started(left);
        }
    }
}

/// State shared by every worker of one run.
struct RunContext {
    progress: Arc<dyn ProgressStore>,
    downloader: Arc<dyn Downloader>,
    uploader: Arc<dyn Uploader>,
    retry: RetryPolicy,
    max_job_attempts: u32,
    stop: CancellationToken,
    stats: StdMutex<StatsCollector>,
    failure: StdMutex<Option<SyncError>>,
    /// Keys already terminal or queued in this run
    seen: StdMutex<HashSet<String>>,
}

impl RunContext {
    fn abort(&self, error: SyncError) {
        error!(error = %error, "Progress store failed, stopping run");
        if let Ok(mut slot) = self.failure.lock() {
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.stop.cancel();
    }

    fn record(&self, kind: JobKind, outcome: JobState, took: std::time::Duration) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(kind, outcome, took);
        }
    }

    fn not_started(&self, count: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.not_started(count);
        }
    }

    /// Returns false if `key` was already seen.
    fn mark_seen(&self, key: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(key.to_string()),
            Err(_) => false,
        }
    }
}

enum Transfer {
    Fetched(PathBuf),
    Archived(String),
}

async fn worker_loop(
    kind: JobKind,
    worker_id: usize,
    ctx: Arc<RunContext>,
    rx: Arc<Mutex<mpsc::Receiver<JobItem>>>,
    chain: Option<mpsc::Sender<JobItem>>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(job) = next else {
            break;
        };

        if ctx.stop.is_cancelled() {
            ctx.not_started(1);
            continue;
        }

        process_job(kind, worker_id, &ctx, job, chain.as_ref()).await;
    }

    debug!(pool = %kind, worker_id, "Worker stopped");
}

async fn process_job(
    kind: JobKind,
    worker_id: usize,
    ctx: &RunContext,
    mut job: JobItem,
    chain: Option<&mpsc::Sender<JobItem>>,
) {
    let started = Instant::now();

    if let Err(e) = job.claim() {
        warn!(job = %job.key, error = %e, "Skipping job that cannot be claimed");
        return;
    }
    if let Err(e) = ctx.progress.upsert(&job).await {
        ctx.not_started(1);
        ctx.abort(e);
        return;
    }

    debug!(pool = %kind, worker_id, job = %job.key, attempt = job.attempts, "Job claimed");

    let result = match kind {
        JobKind::Download => ctx
            .retry
            .call(|| ctx.downloader.fetch(&job.key, &job.metadata))
            .await
            .map(Transfer::Fetched),
        JobKind::Upload => match job.local_path.clone() {
            Some(path) => ctx
                .retry
                .call(|| ctx.uploader.archive(&path, &job.metadata))
                .await
                .map(Transfer::Archived),
            None => Err(crate::retry::RetryError::Permanent(BridgeError::Permanent(
                format!("upload job {} has no local path", job.key),
            ))),
        },
    };

    let mut follow_up = None;
    let transition = match result {
        Ok(Transfer::Fetched(path)) => {
            follow_up = Some(path);
            job.complete().map(|_| JobState::Done)
        }
        Ok(Transfer::Archived(remote_key)) => {
            job.metadata
                .insert(ARCHIVED_AS_METADATA_KEY.to_string(), remote_key);
            job.complete().map(|_| JobState::Done)
        }
        Err(e) => {
            let message = e.to_string();
            let outcome = job.record_failure(message.clone(), ctx.max_job_attempts);
            if let Ok(state) = &outcome {
                warn!(
                    pool = %kind,
                    job = %job.key,
                    attempt = job.attempts,
                    max_attempts = ctx.max_job_attempts,
                    state = %state,
                    error = %message,
                    "Job failed"
                );
            }
            outcome
        }
    };

    let outcome = match transition {
        Ok(state) => state,
        Err(e) => {
            error!(job = %job.key, error = %e, "Invalid job transition");
            return;
        }
    };

    if let Err(e) = ctx.progress.upsert(&job).await {
        ctx.record(kind, outcome, started.elapsed());
        ctx.abort(e);
        return;
    }
    ctx.record(kind, outcome, started.elapsed());

    if outcome == JobState::Done {
        debug!(
            pool = %kind,
            job = %job.key,
            took_ms = started.elapsed().as_millis() as u64,
            "Job done"
        );
    }

    if let (Some(path), Some(tx)) = (follow_up, chain) {
        enqueue_archive(ctx, &job, path, tx).await;
    }
}

async fn enqueue_archive(
    ctx: &RunContext,
    source: &JobItem,
    path: PathBuf,
    tx: &mpsc::Sender<JobItem>,
) {
    let key = format!("{}{}", ARCHIVE_KEY_PREFIX, source.key);
    if !ctx.mark_seen(&key) {
        debug!(job = %key, "Archive job already known, not chaining");
        return;
    }

    let mut upload = JobItem::upload(key, path);
    upload.metadata = source.metadata.clone();

    if let Err(e) = ctx.progress.upsert(&upload).await {
        ctx.abort(e);
        return;
    }

    tokio::select! {
        biased;
        _ = ctx.stop.cancelled() => ctx.not_started(1),
        sent = tx.send(upload) => {
            if sent.is_err() {
                ctx.not_started(1);
            }
        }
    }
}

/// Push `jobs` into a pool queue until done or stopped. Returns how many were
/// never sent.
async fn feed(jobs: Vec<JobItem>, tx: mpsc::Sender<JobItem>, stop: CancellationToken) -> u64 {
    let total = jobs.len() as u64;
    let mut sent = 0u64;

    for job in jobs {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = tx.send(job) => {
                if result.is_err() {
                    break;
                }
                sent += 1;
            }
        }
    }

    total - sent
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs job sets against a downloader and an uploader.
pub struct JobOrchestrator {
    progress: Arc<dyn ProgressStore>,
    downloader: Arc<dyn Downloader>,
    uploader: Arc<dyn Uploader>,
    retry: RetryPolicy,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        progress: Arc<dyn ProgressStore>,
        downloader: Arc<dyn Downloader>,
        uploader: Arc<dyn Uploader>,
        retry: RetryPolicy,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            progress,
            downloader,
            uploader,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `jobs` with explicit pool sizes.
    pub async fn run(
        &self,
        jobs: Vec<JobItem>,
        download_concurrency: usize,
        upload_concurrency: usize,
    ) -> Result<RunStats> {
        self.run_with_cancel(
            jobs,
            download_concurrency,
            upload_concurrency,
            CancellationToken::new(),
        )
        .await
    }

    /// Run `jobs` with the configured pool sizes until done or `cancel` fires.
    pub async fn run_configured(
        &self,
        jobs: Vec<JobItem>,
        cancel: CancellationToken,
    ) -> Result<RunStats> {
        self.run_with_cancel(
            jobs,
            self.config.download_concurrency,
            self.config.upload_concurrency,
            cancel,
        )
        .await
    }

    /// Run `jobs` until every queued job is processed or `cancel` fires.
    ///
    /// Cancellation is not an error: the returned stats count the jobs that
    /// were never started.
    #[instrument(skip(self, jobs, cancel), fields(jobs = jobs.len()))]
    pub async fn run_with_cancel(
        &self,
        jobs: Vec<JobItem>,
        download_concurrency: usize,
        upload_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<RunStats> {
        let started = Instant::now();

        // Phase 1: merge requested jobs with the ledger
        let ledger = self.progress.load().await?;
        let mut seen = HashSet::new();
        let mut skipped = 0u64;
        let mut runnable = Vec::new();

        for requested in jobs {
            if !seen.insert(requested.key.clone()) {
                continue;
            }
            match ledger.get(&requested.key) {
                Some(known) if known.state.is_terminal() => skipped += 1,
                Some(known) => {
                    let mut item = known.clone();
                    if item.metadata.is_empty() {
                        item.metadata = requested.metadata;
                    }
                    if item.local_path.is_none() {
                        item.local_path = requested.local_path;
                    }
                    runnable.push(item);
                }
                None => runnable.push(requested),
            }
        }
        for (key, known) in &ledger {
            if seen.insert(key.clone()) && !known.state.is_terminal() {
                runnable.push(known.clone());
            }
        }
        // Terminal ledger entries must never be chained again.
        for (key, known) in &ledger {
            if known.state.is_terminal() {
                seen.insert(key.clone());
            }
        }

        let mut not_started = 0u64;
        if let Some(limit) = self.config.item_limit {
            if runnable.len() > limit {
                not_started += (runnable.len() - limit) as u64;
                runnable.truncate(limit);
            }
        }

        let (downloads, uploads): (Vec<_>, Vec<_>) = runnable
            .into_iter()
            .partition(|job| job.kind == JobKind::Download);

        info!(
            downloads = downloads.len(),
            uploads = uploads.len(),
            skipped,
            deferred = not_started,
            "Phase 1: Queued jobs"
        );

        let mut collector = StatsCollector::default();
        collector.skipped(skipped);
        collector.not_started(not_started);

        let stop = cancel.child_token();
        let ctx = Arc::new(RunContext {
            progress: Arc::clone(&self.progress),
            downloader: Arc::clone(&self.downloader),
            uploader: Arc::clone(&self.uploader),
            retry: self.retry.clone(),
            max_job_attempts: self.config.max_job_attempts.max(1),
            stop: stop.clone(),
            stats: StdMutex::new(collector),
            failure: StdMutex::new(None),
            seen: StdMutex::new(seen),
        });

        // Phase 2: run both pools
        let download_pool = WorkerPool::new(JobKind::Download, download_concurrency);
        let upload_pool = WorkerPool::new(JobKind::Upload, upload_concurrency);

        let (download_tx, download_rx) = mpsc::channel(download_pool.queue_capacity());
        let (upload_tx, upload_rx) = mpsc::channel(upload_pool.queue_capacity());

        let chain = self.config.chain_uploads.then(|| upload_tx.clone());
        let downloads_running = download_pool.spawn(Arc::clone(&ctx), download_rx, chain);
        let uploads_running = upload_pool.spawn(Arc::clone(&ctx), upload_rx, None);

        info!(
            download_workers = download_pool.concurrency(),
            upload_workers = upload_pool.concurrency(),
            chain_uploads = self.config.chain_uploads,
            "Phase 2: Processing jobs"
        );

        let download_feeder = tokio::spawn(feed(downloads, download_tx, stop.clone()));
        let upload_feeder = tokio::spawn(feed(uploads, upload_tx, stop.clone()));

        for feeder in [download_feeder, upload_feeder] {
            match feeder.await {
                Ok(unsent) if unsent > 0 => ctx.not_started(unsent),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Job feeder failed"),
            }
        }

        downloads_running.join(&ctx).await;
        uploads_running.join(&ctx).await;

        // Phase 3: report
        let collector = match ctx.stats.lock() {
            Ok(mut stats) => std::mem::take(&mut *stats),
            Err(_) => StatsCollector::default(),
        };
        let failure = ctx.failure.lock().ok().and_then(|mut slot| slot.take());

        if let Some(source) = failure {
            let completed = collector.done();
            return Err(SyncError::RunAborted {
                completed,
                source: Box::new(source),
            });
        }

        let stats = collector.finish(started.elapsed());
        if cancel.is_cancelled() {
            warn!(not_started = stats.not_started, "Run cancelled");
        }
        info!(
            done = stats.done,
            failed = stats.failed,
            retry_pending = stats.retry_pending,
            skipped = stats.skipped,
            not_started = stats.not_started,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            p50_ms = stats.durations.p50.as_millis() as u64,
            p99_ms = stats.durations.p99.as_millis() as u64,
            "Phase 3: Run complete"
        );

        Ok(stats)
    }
}
