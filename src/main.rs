//! `archive-pipeline`: run one lock, pull, process, push, release cycle.
//!
//! All settings come from `ARCHIVE_PIPELINE_*` environment variables. Job keys
//! are read one per line from `ARCHIVE_PIPELINE_JOBS_FILE`; blank lines and
//! lines starting with `#` are ignored.
//!
//! Exit codes: 0 success, 1 configuration or unexpected error, 2 lock wait
//! timed out, 3 remote sync failure, 4 too many terminally failed jobs.

use anyhow::Context;
use bridge_desktop::{
    FsObjectStore, HttpDownloader, JsonLinesLogSink, ObjectStoreUploader, ReqwestHttpClient,
};
use bridge_traits::{http::HttpClient, storage::ObjectStore, time::LoggerSink};
use core_runtime::config::{PipelineConfig, StoreConfig};
use core_runtime::logging::{init_logging, LoggingConfig};
use core_sync::{JobItem, JsonFileProgressStore, PipelineCoordinator, SyncError};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("archive-pipeline: {e:#}");
            e.downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;

    let run_log = match &config.run_log {
        Some(path) => Some(Arc::new(
            JsonLinesLogSink::open(path, config.log_level)
                .with_context(|| format!("cannot open run log {}", path.display()))?,
        )),
        None => None,
    };

    let mut logging = LoggingConfig::default().with_level(config.log_level);
    if let Some(format) = config.log_format {
        logging = logging.with_format(format);
    }
    if let Some(sink) = &run_log {
        logging = logging.with_sink(Arc::clone(sink) as Arc<dyn LoggerSink>);
    }
    init_logging(logging).context("failed to initialise logging")?;

    let outcome = execute(&config).await;
    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "archive-pipeline failed");
    }
    if let Some(sink) = &run_log {
        if let Err(e) = sink.flush().await {
            eprintln!("archive-pipeline: run log flush failed: {e}");
        }
    }
    outcome
}

async fn execute(config: &PipelineConfig) -> anyhow::Result<i32> {
    let http_client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);
    let store = build_store(config, Arc::clone(&http_client))?;

    tokio::fs::create_dir_all(&config.workers.download_dir)
        .await
        .with_context(|| format!("cannot create {}", config.workers.download_dir.display()))?;
    let downloader = Arc::new(HttpDownloader::new(http_client, &config.workers.download_dir));
    let uploader = Arc::new(ObjectStoreUploader::new(
        Arc::clone(&store),
        config.workers.archive_prefix.clone(),
    ));
    let progress = Arc::new(JsonFileProgressStore::new(&config.progress_path));

    let jobs = match &config.jobs_file {
        Some(path) => read_jobs(path).await?,
        None => Vec::new(),
    };
    info!(jobs = jobs.len(), "Loaded job list");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight jobs");
            on_signal.cancel();
        }
    });

    let coordinator = PipelineCoordinator::from_config(config, store, progress, downloader, uploader);
    let report = coordinator.run(jobs, cancel).await?;

    if let Some(stats) = &report.stats {
        info!(
            done = stats.done,
            failed = stats.failed,
            retry_pending = stats.retry_pending,
            skipped = stats.skipped,
            not_started = stats.not_started,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Run summary"
        );
    }
    Ok(report.exit_code(config.workers.failed_job_threshold))
}

fn build_store(
    config: &PipelineConfig,
    http_client: Arc<dyn HttpClient>,
) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match &config.store {
        #[cfg(feature = "http-store")]
        StoreConfig::Remote(remote) => {
            Ok(Arc::new(provider_http_store::HttpObjectStore::from_config(
                http_client,
                remote,
            )))
        }
        #[cfg(not(feature = "http-store"))]
        StoreConfig::Remote(remote) => {
            let _ = http_client;
            anyhow::bail!(
                "remote store {} configured but built without the http-store feature",
                remote.base_url
            )
        }
        StoreConfig::Local { root } => {
            let root = root.clone().unwrap_or_else(FsObjectStore::default_root);
            info!(root = %root.display(), "Using local object store");
            Ok(Arc::new(FsObjectStore::new(root)))
        }
    }
}

async fn read_jobs(path: &Path) -> anyhow::Result<Vec<JobItem>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read jobs file {}", path.display()))?;
    Ok(parse_jobs(&raw))
}

fn parse_jobs(raw: &str) -> Vec<JobItem> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(JobItem::download)
        .collect()
}
