//! # Pipeline Configuration Module
//!
//! Provides configuration management for the archive pipeline.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `PipelineConfig` instance that holds every externally supplied setting:
//! remote store location and credentials, lock timing, worker pool sizes and
//! retry behaviour. It enforces fail-fast validation so a misconfigured run
//! stops before it touches the lock or the shared database.
//!
//! ## Sources
//!
//! - [`PipelineConfig::builder`] for programmatic construction (tests, embedding)
//! - [`PipelineConfig::from_env`] for CI runners and developer machines; every
//!   variable is prefixed with [`ENV_PREFIX`]
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::PipelineConfig;
//! use std::time::Duration;
//!
//! let config = PipelineConfig::builder()
//!     .database_path("/data/archive.sqlite")
//!     .remote_store("https://archive.example/bucket", Some("key"), Some("secret"))
//!     .lock_timeout_minutes(30)
//!     .download_concurrency(3)
//!     .upload_concurrency(2)
//!     .retry(4, Duration::from_secs(1))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! Validation failures return [`Error::Config`] naming the offending setting
//! and, for environment input, the variable to fix.

use crate::error::{Error, Result};
use crate::logging::{redact_if_sensitive, LogFormat};
use bridge_traits::time::LogLevel;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix shared by every environment variable the pipeline reads.
pub const ENV_PREFIX: &str = "ARCHIVE_PIPELINE_";

/// Location of, and credentials for, the HTTP archive API.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteStoreConfig {
    /// Base URL objects are addressed under
    pub base_url: String,
    /// Access key (sent as `LOW access:secret`)
    pub access_key: Option<String>,
    /// Secret key
    pub secret_key: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl std::fmt::Debug for RemoteStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreConfig")
            .field("base_url", &self.base_url)
            .field("access_key", &self.access_key)
            .field(
                "secret_key",
                &self
                    .secret_key
                    .as_deref()
                    .map(|s| redact_if_sensitive("secret_key", s)),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Which object store backs the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// HTTP archive API
    Remote(RemoteStoreConfig),
    /// Local directory store; `None` selects the platform data directory
    Local { root: Option<PathBuf> },
}

/// Distributed lock timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    /// Lock name; the sentinel lives at a fixed key derived from it
    pub name: String,
    /// Declared maximum hold duration
    pub timeout_minutes: u64,
    /// Fixed interval between acquisition attempts while the lock is busy
    pub poll_interval: Duration,
    /// Give up acquiring after this long
    pub wait_timeout: Duration,
    /// Holder identity recorded in the sentinel; defaults to the OS user
    pub holder: Option<String>,
}

/// Backoff applied to every remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Worker pool and job bookkeeping settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    /// Total claims per job. The claim that brings `attempts` to this value
    /// is the last one: if it fails the job is terminally `failed`.
    pub max_job_attempts: u32,
    /// Stop enqueuing after this many items
    pub item_limit: Option<usize>,
    /// Completed downloads enqueue an upload of the fetched file
    pub chain_uploads: bool,
    /// Non-zero exit when more jobs than this failed during the run
    pub failed_job_threshold: Option<u64>,
    /// Where downloaded documents land
    pub download_dir: PathBuf,
    /// Remote prefix archived documents are stored under
    pub archive_prefix: String,
}

/// Complete pipeline configuration.
///
/// Use [`PipelineConfigBuilder`] or [`PipelineConfig::from_env`] to construct
/// instances; both validate before returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Local copy of the shared database
    pub database_path: PathBuf,
    /// Remote key of the shared database snapshot
    pub remote_database_key: String,
    /// Remote prefix losing snapshots are backed up under
    pub backup_prefix: String,
    /// Local progress ledger
    pub progress_path: PathBuf,
    /// Optional file with one job key per line
    pub jobs_file: Option<PathBuf>,
    pub store: StoreConfig,
    pub lock: LockSettings,
    pub retry: RetrySettings,
    pub workers: WorkerSettings,
    /// Log output format; `None` picks the build default
    pub log_format: Option<LogFormat>,
    pub log_level: LogLevel,
    /// Optional JSON-lines copy of the run log
    pub run_log: Option<PathBuf>,
}

impl PipelineConfig {
    /// Create a new configuration builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `lookup` receives full variable names (including [`ENV_PREFIX`]).
    /// Unset or empty variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut builder = Self::builder();

        if let Some(v) = env.string("DATABASE_PATH") {
            builder = builder.database_path(v);
        }
        if let Some(v) = env.string("REMOTE_DATABASE_KEY") {
            builder = builder.remote_database_key(v);
        }
        if let Some(v) = env.string("BACKUP_PREFIX") {
            builder = builder.backup_prefix(v);
        }
        if let Some(v) = env.string("PROGRESS_PATH") {
            builder = builder.progress_path(v);
        }
        if let Some(v) = env.string("JOBS_FILE") {
            builder = builder.jobs_file(v);
        }

        if let Some(url) = env.string("STORE_URL") {
            builder = builder.remote_store(url, env.string("ACCESS_KEY"), env.string("SECRET_KEY"));
        } else if let Some(root) = env.string("STORE_ROOT") {
            builder = builder.local_store(Some(PathBuf::from(root)));
        }
        if let Some(secs) = env.parse::<u64>("REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }

        if let Some(v) = env.string("LOCK_NAME") {
            builder = builder.lock_name(v);
        }
        if let Some(v) = env.parse("LOCK_TIMEOUT_MINUTES")? {
            builder = builder.lock_timeout_minutes(v);
        }
        if let Some(v) = env.parse("LOCK_POLL_SECS")? {
            builder = builder.lock_poll_interval(Duration::from_secs(v));
        }
        if let Some(v) = env.parse("LOCK_WAIT_SECS")? {
            builder = builder.lock_wait_timeout(Duration::from_secs(v));
        }
        if let Some(v) = env.string("LOCK_HOLDER") {
            builder = builder.lock_holder(v);
        }

        if let Some(v) = env.parse("DOWNLOAD_CONCURRENCY")? {
            builder = builder.download_concurrency(v);
        }
        if let Some(v) = env.parse("UPLOAD_CONCURRENCY")? {
            builder = builder.upload_concurrency(v);
        }
        if let Some(v) = env.parse("RETRY_MAX_ATTEMPTS")? {
            builder = builder.retry_max_attempts(v);
        }
        if let Some(v) = env.parse("RETRY_BASE_DELAY_MS")? {
            builder = builder.retry_base_delay(Duration::from_millis(v));
        }
        if let Some(v) = env.parse("RETRY_MAX_DELAY_MS")? {
            builder = builder.retry_max_delay(Duration::from_millis(v));
        }
        if let Some(v) = env.parse("MAX_JOB_ATTEMPTS")? {
            builder = builder.max_job_attempts(v);
        }
        if let Some(v) = env.parse("ITEM_LIMIT")? {
            builder = builder.item_limit(v);
        }
        if let Some(v) = env.parse("CHAIN_UPLOADS")? {
            builder = builder.chain_uploads(v);
        }
        if let Some(v) = env.parse("FAILED_JOB_THRESHOLD")? {
            builder = builder.failed_job_threshold(v);
        }
        if let Some(v) = env.string("DOWNLOAD_DIR") {
            builder = builder.download_dir(v);
        }
        if let Some(v) = env.string("ARCHIVE_PREFIX") {
            builder = builder.archive_prefix(v);
        }

        if let Some(v) = env.string("LOG_FORMAT") {
            builder = builder.log_format(v.parse().map_err(|_| {
                Error::Config(format!(
                    "{}LOG_FORMAT must be one of pretty, json, compact (got '{}')",
                    ENV_PREFIX, v
                ))
            })?);
        }
        if let Some(v) = env.string("LOG_LEVEL") {
            builder = builder.log_level(v.parse().map_err(|_| {
                Error::Config(format!(
                    "{}LOG_LEVEL must be one of trace, debug, info, warn, error (got '{}')",
                    ENV_PREFIX, v
                ))
            })?);
        }

        if let Some(v) = env.string("RUN_LOG") {
            builder = builder.run_log(v);
        }

        builder.build()
    }

    /// Validate every setting, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        require_path(&self.database_path, "database_path")?;
        require_path(&self.progress_path, "progress_path")?;
        require_key(&self.remote_database_key, "remote_database_key")?;
        require_key(&self.backup_prefix, "backup_prefix")?;

        if self.backup_prefix.trim_end_matches('/') == self.remote_database_key {
            return Err(Error::Config(
                "backup_prefix must differ from remote_database_key".to_string(),
            ));
        }

        match &self.store {
            StoreConfig::Remote(remote) => {
                if !(remote.base_url.starts_with("http://") || remote.base_url.starts_with("https://"))
                {
                    return Err(Error::Config(format!(
                        "Remote store URL must start with http:// or https:// (got '{}')",
                        remote.base_url
                    )));
                }
                if remote.access_key.is_some() != remote.secret_key.is_some() {
                    return Err(Error::Config(
                        "Remote store credentials need both access_key and secret_key".to_string(),
                    ));
                }
                if remote.request_timeout.is_zero() {
                    return Err(Error::Config("request_timeout must be non-zero".to_string()));
                }
            }
            StoreConfig::Local { root: Some(root) } => require_path(root, "store root")?,
            StoreConfig::Local { root: None } => {}
        }

        let lock = &self.lock;
        if lock.name.is_empty()
            || !lock
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::Config(format!(
                "Lock name must be non-empty and contain only [A-Za-z0-9._-] (got '{}')",
                lock.name
            )));
        }
        if lock.timeout_minutes == 0 {
            return Err(Error::Config("lock timeout_minutes must be at least 1".to_string()));
        }
        if lock.poll_interval.is_zero() {
            return Err(Error::Config("lock poll_interval must be non-zero".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(format!(
                "retry base_delay ({:?}) exceeds max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }

        let workers = &self.workers;
        if workers.download_concurrency == 0 || workers.upload_concurrency == 0 {
            return Err(Error::Config(
                "download and upload concurrency must be at least 1".to_string(),
            ));
        }
        if workers.max_job_attempts == 0 {
            return Err(Error::Config("max_job_attempts must be at least 1".to_string()));
        }
        require_path(&workers.download_dir, "download_dir")?;

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/archive.sqlite"),
            remote_database_key: "db/archive.sqlite".to_string(),
            backup_prefix: "db/backups".to_string(),
            progress_path: PathBuf::from("data/progress.json"),
            jobs_file: None,
            store: StoreConfig::Local { root: None },
            lock: LockSettings {
                name: "db-lock".to_string(),
                timeout_minutes: 60,
                poll_interval: Duration::from_secs(30),
                wait_timeout: Duration::from_secs(30 * 60),
                holder: None,
            },
            retry: RetrySettings {
                max_attempts: 4,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
            workers: WorkerSettings {
                download_concurrency: 3,
                upload_concurrency: 2,
                max_job_attempts: 3,
                item_limit: None,
                chain_uploads: false,
                failed_job_threshold: None,
                download_dir: PathBuf::from("data/downloads"),
                archive_prefix: "documents".to_string(),
            },
            log_format: None,
            log_level: LogLevel::Info,
            run_log: None,
        }
    }
}

/// Builder for constructing `PipelineConfig` instances.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    request_timeout: Option<Duration>,
}

impl PipelineConfigBuilder {
    pub fn database_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.database_path = path.as_ref().to_path_buf();
        self
    }

    pub fn remote_database_key(mut self, key: impl Into<String>) -> Self {
        self.config.remote_database_key = key.into();
        self
    }

    pub fn backup_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.backup_prefix = prefix.into();
        self
    }

    pub fn progress_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.progress_path = path.as_ref().to_path_buf();
        self
    }

    pub fn jobs_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config.jobs_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use the HTTP archive API at `base_url`.
    pub fn remote_store(
        mut self,
        base_url: impl Into<String>,
        access_key: Option<impl Into<String>>,
        secret_key: Option<impl Into<String>>,
    ) -> Self {
        self.config.store = StoreConfig::Remote(RemoteStoreConfig {
            base_url: base_url.into(),
            access_key: access_key.map(Into::into),
            secret_key: secret_key.map(Into::into),
            request_timeout: Duration::from_secs(60),
        });
        self
    }

    /// Use a directory-backed store.
    pub fn local_store(mut self, root: Option<PathBuf>) -> Self {
        self.config.store = StoreConfig::Local { root };
        self
    }

    /// Per-request timeout for the remote store (ignored for local stores).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn lock_name(mut self, name: impl Into<String>) -> Self {
        self.config.lock.name = name.into();
        self
    }

    pub fn lock_timeout_minutes(mut self, minutes: u64) -> Self {
        self.config.lock.timeout_minutes = minutes;
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lock.poll_interval = interval;
        self
    }

    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock.wait_timeout = timeout;
        self
    }

    pub fn lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.config.lock.holder = Some(holder.into());
        self
    }

    pub fn download_concurrency(mut self, n: usize) -> Self {
        self.config.workers.download_concurrency = n;
        self
    }

    pub fn upload_concurrency(mut self, n: usize) -> Self {
        self.config.workers.upload_concurrency = n;
        self
    }

    /// Set retry attempts and base delay together.
    pub fn retry(self, max_attempts: u32, base_delay: Duration) -> Self {
        self.retry_max_attempts(max_attempts)
            .retry_base_delay(base_delay)
    }

    pub fn retry_max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn max_job_attempts(mut self, n: u32) -> Self {
        self.config.workers.max_job_attempts = n;
        self
    }

    pub fn item_limit(mut self, limit: usize) -> Self {
        self.config.workers.item_limit = Some(limit);
        self
    }

    pub fn chain_uploads(mut self, enabled: bool) -> Self {
        self.config.workers.chain_uploads = enabled;
        self
    }

    pub fn failed_job_threshold(mut self, threshold: u64) -> Self {
        self.config.workers.failed_job_threshold = Some(threshold);
        self
    }

    pub fn download_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.workers.download_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn archive_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.workers.archive_prefix = prefix.into();
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = Some(format);
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn run_log(mut self, path: impl AsRef<Path>) -> Self {
        self.config.run_log = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn build(self) -> Result<PipelineConfig> {
        let mut config = self.config;
        if let (Some(timeout), StoreConfig::Remote(remote)) = (self.request_timeout, &mut config.store)
        {
            remote.request_timeout = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.string(name) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                Error::Config(format!(
                    "{}{} has an invalid value '{}'",
                    ENV_PREFIX, name, raw
                ))
            }),
        }
    }
}

fn require_path(path: &Path, what: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::Config(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn require_key(key: &str, what: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|s| s == "..") {
        return Err(Error::Config(format!(
            "{} must be a relative object key (got '{}')",
            what, key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config.lock.poll_interval, Duration::from_secs(30));
        assert_eq!(config.workers.download_concurrency, 3);
        assert_eq!(config.workers.upload_concurrency, 2);
        assert_eq!(config.store, StoreConfig::Local { root: None });
    }

    #[test]
    fn test_builder_remote_store() {
        let config = PipelineConfig::builder()
            .remote_store("https://archive.example/bucket", Some("key"), Some("secret"))
            .request_timeout(Duration::from_secs(5))
            .lock_timeout_minutes(10)
            .retry(5, Duration::from_millis(250))
            .build()
            .unwrap();

        match &config.store {
            StoreConfig::Remote(remote) => {
                assert_eq!(remote.base_url, "https://archive.example/bucket");
                assert_eq!(remote.request_timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected store {:?}", other),
        }
        assert_eq!(config.lock.timeout_minutes, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            PipelineConfig::builder().download_concurrency(0).build(),
            PipelineConfig::builder().lock_timeout_minutes(0).build(),
            PipelineConfig::builder().lock_name("db lock").build(),
            PipelineConfig::builder().retry_max_attempts(0).build(),
            PipelineConfig::builder().remote_database_key("/abs").build(),
            PipelineConfig::builder()
                .remote_store("ftp://archive", None::<String>, None::<String>)
                .build(),
            PipelineConfig::builder()
                .remote_store("https://archive", Some("key"), None::<String>)
                .build(),
            PipelineConfig::builder()
                .retry_base_delay(Duration::from_secs(120))
                .build(),
        ];

        for result in cases {
            assert!(matches!(result, Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("STORE_URL", "https://archive.example"),
            ("ACCESS_KEY", "ak"),
            ("SECRET_KEY", "sk"),
            ("LOCK_TIMEOUT_MINUTES", "15"),
            ("LOCK_POLL_SECS", "5"),
            ("DOWNLOAD_CONCURRENCY", "4"),
            ("RETRY_BASE_DELAY_MS", "500"),
            ("ITEM_LIMIT", "100"),
            ("CHAIN_UPLOADS", "true"),
            ("LOG_FORMAT", "json"),
            ("LOG_LEVEL", "debug"),
            ("RUN_LOG", "logs/run.jsonl"),
        ]))
        .unwrap();

        assert!(matches!(config.store, StoreConfig::Remote(_)));
        assert_eq!(config.lock.timeout_minutes, 15);
        assert_eq!(config.lock.poll_interval, Duration::from_secs(5));
        assert_eq!(config.workers.download_concurrency, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.workers.item_limit, Some(100));
        assert!(config.workers.chain_uploads);
        assert_eq!(config.log_format, Some(LogFormat::Json));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.run_log, Some(PathBuf::from("logs/run.jsonl")));
    }

    #[test]
    fn test_from_lookup_reports_variable() {
        let err = PipelineConfig::from_lookup(lookup(&[("UPLOAD_CONCURRENCY", "many")])).unwrap_err();
        assert!(err.to_string().contains("ARCHIVE_PIPELINE_UPLOAD_CONCURRENCY"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = PipelineConfig::builder()
            .remote_store("https://archive.example", Some("ak"), Some("hunter2"))
            .build()
            .unwrap();

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
