//! # Host Bridge Traits
//!
//! Capability traits the pipeline core depends on but does not implement.
//!
//! ## Overview
//!
//! This crate defines the contract between the pipeline core (`core-sync`) and
//! the concrete adapters that talk to disks, HTTP endpoints and the remote
//! archive. Everything in the core is constructed from `Arc<dyn Trait>` values
//! so tests can substitute in-memory fakes.
//!
//! ## Traits
//!
//! ### Remote storage
//! - [`ObjectStore`](storage::ObjectStore) - put/get/stat/delete/list against the remote archive
//!
//! ### Transfers
//! - [`HttpClient`](http::HttpClient) - Async HTTP operations
//! - [`Downloader`](transfer::Downloader) - Fetch one source document to local disk
//! - [`Uploader`](transfer::Uploader) - Archive one local file remotely
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Structured copy of the run log
//!
//! ## Implementations
//!
//! | Capability | Crate |
//! |------------|-------|
//! | `HttpClient`, `Downloader`, `Uploader`, local `ObjectStore` | `bridge-desktop` |
//! | HTTP `ObjectStore` | `provider-http-store` |
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. The
//! variant is the retry contract: `Transient` (and transient IO kinds) may be
//! retried, `NotFound` and `Permanent` must not be.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across worker tasks.

pub mod error;
pub mod http;
pub mod storage;
pub mod time;
pub mod transfer;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use storage::{sha256_hex, ObjectMetadata, ObjectStat, ObjectStore, HASH_METADATA_KEY};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, MemoryLogSink, SystemClock};
pub use transfer::{Downloader, Uploader};
