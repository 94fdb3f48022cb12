//! Integration tests for logging and configuration

use bridge_traits::time::LogLevel;
use core_runtime::config::{PipelineConfig, StoreConfig, ENV_PREFIX};
use core_runtime::logging::{redact_if_sensitive, LogFormat, LoggingConfig};
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_logging_config_from_pipeline_config() {
    let pipeline = PipelineConfig::builder()
        .log_format(LogFormat::Json)
        .log_level(LogLevel::Debug)
        .build()
        .unwrap();

    let config = LoggingConfig::default()
        .with_format(pipeline.log_format.unwrap_or_default())
        .with_level(pipeline.log_level)
        .with_span_timings(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(config.redact);
    assert!(config.span_timings);
    assert!(config.sink.is_none());
}

#[test]
fn test_credential_redaction() {
    assert_eq!(redact_if_sensitive("secret_key", "sk-123"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("authorization", "LOW a:b"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("lock", "db-lock"), "db-lock");
}

#[test]
fn test_env_local_store_and_lock_settings() {
    let vars = [
        ("STORE_ROOT", "/srv/archive"),
        ("LOCK_NAME", "nightly-db"),
        ("LOCK_WAIT_SECS", "0"),
        ("LOCK_HOLDER", "ci-runner-7"),
        ("FAILED_JOB_THRESHOLD", "25"),
        ("DATABASE_PATH", "  "),
    ];
    let config = PipelineConfig::from_lookup(|name| {
        vars.iter()
            .find(|(k, _)| format!("{}{}", ENV_PREFIX, k) == name)
            .map(|(_, v)| v.to_string())
    })
    .unwrap();

    assert_eq!(
        config.store,
        StoreConfig::Local {
            root: Some(PathBuf::from("/srv/archive"))
        }
    );
    assert_eq!(config.lock.name, "nightly-db");
    assert_eq!(config.lock.wait_timeout, Duration::ZERO);
    assert_eq!(config.lock.holder.as_deref(), Some("ci-runner-7"));
    assert_eq!(config.workers.failed_job_threshold, Some(25));
    // Blank variables keep defaults
    assert_eq!(config.database_path, PathBuf::from("data/archive.sqlite"));
}

#[test]
fn test_env_rejects_unknown_log_format() {
    let err = PipelineConfig::from_lookup(|name| {
        (name == format!("{}LOG_FORMAT", ENV_PREFIX)).then(|| "xml".to_string())
    })
    .unwrap_err();

    assert!(err.to_string().contains("LOG_FORMAT"));
}

#[test]
fn test_env_level_accepts_warning_alias() {
    let config = PipelineConfig::from_lookup(|name| {
        (name == format!("{}LOG_LEVEL", ENV_PREFIX)).then(|| "WARNING".to_string())
    })
    .unwrap();

    assert_eq!(config.log_level, LogLevel::Warn);
    assert!(config.run_log.is_none());
}
