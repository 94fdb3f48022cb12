//! # Archive Pipeline
//!
//! Facade crate for the archive pipeline workspace.
//!
//! Host applications can depend on `archive-pipeline` alone instead of wiring
//! each workspace crate individually. The `archive-pipeline` binary built from
//! this package is the CI and developer entry point.
//!
//! ## Features
//!
//! - `http-store` (default): remote archive API support via `provider-http-store`

pub use bridge_desktop as desktop;
pub use bridge_traits as bridge;
pub use core_runtime as runtime;
pub use core_sync as sync;

pub use bridge_traits::{
    error::BridgeError,
    storage::ObjectStore,
    transfer::{Downloader, Uploader},
};
pub use core_runtime::config::{PipelineConfig, StoreConfig};
pub use core_sync::{
    JobItem, JobKind, JobOrchestrator, PipelineCoordinator, PipelineReport, PipelineState,
    RunStats, SyncError,
};

#[cfg(feature = "http-store")]
pub use provider_http_store as http_store;
