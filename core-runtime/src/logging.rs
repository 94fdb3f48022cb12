//! # Logging & Tracing Infrastructure
//!
//! Installs the global `tracing` subscriber for a pipeline run.
//!
//! ## Overview
//!
//! Terminal output goes to stderr in one of three formats: `pretty` for
//! developer machines, `compact` for interactive CI logs and `json` for log
//! collectors. A [`LoggerSink`] can additionally receive a structured copy of
//! every event that passes the filter; the binary uses this for the optional
//! JSON-lines run log.
//!
//! Field values are passed through [`redact_if_sensitive`] before they reach
//! a sink, so store credentials never land in an artifact.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::time::LogLevel;
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogLevel::Debug),
//! )?;
//! tracing::info!(lock = "db-lock", "Lock acquired");
//! ```

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::format::FmtSpan,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer, Registry,
};

/// Crates whose events follow the configured level; everything else is
/// held at `warn`.
const WORKSPACE_CRATES: &[&str] = &[
    "archive_pipeline",
    "core_runtime",
    "core_sync",
    "provider_http_store",
    "bridge_desktop",
];

const NOISY_DEPENDENCIES: &[&str] = &["h2", "hyper", "hyper_util", "reqwest", "rustls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Logging(format!(
                "unknown log format '{}' (expected pretty, json or compact)",
                other
            ))),
        }
    }
}

/// Subscriber settings
#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Full `EnvFilter` directive string; replaces the per-crate default
    pub filter: Option<String>,
    /// Redact sensitive fields before they reach the sink
    pub redact: bool,
    pub sink: Option<Arc<dyn LoggerSink>>,
    /// Emit an event when a span closes, with its busy/idle time
    pub span_timings: bool,
    pub display_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            redact: true,
            sink: None,
            span_timings: false,
            display_target: true,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("filter", &self.filter)
            .field("redact", &self.redact)
            .field("sink", &self.sink.is_some())
            .field("span_timings", &self.span_timings)
            .field("display_target", &self.display_target)
            .finish()
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_span_timings(mut self, enable: bool) -> Self {
        self.span_timings = enable;
        self
    }

    pub fn with_target(mut self, display: bool) -> Self {
        self.display_target = display;
        self
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// [`Error::Logging`] if the filter does not parse or a global subscriber
/// is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;
    let sink = SinkLayer::new(config.sink.clone(), config.redact);

    tracing_subscriber::registry()
        .with(fmt_layer(&config))
        .with(sink)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Logging(format!("Failed to initialize logging: {}", e)))
}

fn fmt_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.display_target)
        .with_span_events(span_events)
        .with_writer(io::stderr);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = match &config.filter {
        Some(custom) => custom.clone(),
        None => WORKSPACE_CRATES
            .iter()
            .map(|name| format!("{}={}", name, config.level))
            .chain(NOISY_DEPENDENCIES.iter().map(|name| format!("{}=warn", name)))
            .collect::<Vec<_>>()
            .join(","),
    };

    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Logging(format!("Invalid log filter '{}': {}", directives, e)))
}

/// Mirrors events into a [`LoggerSink`].
struct SinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl SinkLayer {
    fn new(sink: Option<Arc<dyn LoggerSink>>, redact: bool) -> Self {
        Self { sink, redact }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let metadata = event.metadata();
        let level = log_level(*metadata.level());
        if level < sink.min_level() {
            return;
        }

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .unwrap_or_else(|| metadata.name().to_string());
        let mut entry = LogEntry::new(level, metadata.target(), message);
        for (key, value) in visitor.fields {
            let value = if self.redact {
                redact_if_sensitive(&key, &value)
            } else {
                value
            };
            entry = entry.with_field(key, value);
        }
        if let Some(span) = ctx.event_span(event) {
            entry = entry.with_span(span.name());
        }

        // Delivered inline so entries keep emission order and a later
        // `flush` sees every event logged before it.
        if let Err(err) = futures::executor::block_on(sink.log(entry)) {
            eprintln!("log sink error: {}", err);
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: HashMap<String, String>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{:?}", value));
    }
}

fn log_level(level: tracing::Level) -> LogLevel {
    match level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// Replace a value with `[REDACTED]` if its field name or its shape marks
/// it as a credential.
///
/// ```ignore
/// use core_runtime::logging::redact_if_sensitive;
///
/// assert_eq!(redact_if_sensitive("secret_key", "abc"), "[REDACTED]");
/// assert_eq!(redact_if_sensitive("header", "LOW ak:sk"), "[REDACTED]");
/// assert_eq!(redact_if_sensitive("lock", "db-lock"), "db-lock");
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    const SENSITIVE_FIELDS: &[&str] = &[
        "secret",
        "access_key",
        "authorization",
        "password",
        "token",
        "credential",
    ];

    let field = field_name.to_ascii_lowercase();
    let trimmed = value.trim_start();
    if SENSITIVE_FIELDS.iter().any(|f| field.contains(f))
        || trimmed.starts_with("LOW ")
        || trimmed.starts_with("Bearer ")
    {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}
