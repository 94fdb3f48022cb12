//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for developer machines and CI
//! runners (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `ObjectStore` backed by a local directory (`FsObjectStore`) or by memory
//!   (`MemoryObjectStore`)
//! - `Downloader` streaming documents over HTTP (`HttpDownloader`)
//! - `Uploader` archiving files through any `ObjectStore` (`ObjectStoreUploader`)
//! - `LoggerSink` appending JSON lines to a run log (`JsonLinesLogSink`)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{FsObjectStore, HttpDownloader, ReqwestHttpClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let http_client = Arc::new(ReqwestHttpClient::new()?);
//!     let store = Arc::new(FsObjectStore::new(FsObjectStore::default_root()));
//!     let downloader = HttpDownloader::new(http_client, "/tmp/downloads");
//!     Ok(())
//! }
//! ```

mod http;
mod log_sink;
mod memory;
mod object_store;
mod transfer;

pub use http::ReqwestHttpClient;
pub use log_sink::JsonLinesLogSink;
pub use memory::MemoryObjectStore;
pub use object_store::FsObjectStore;
pub use transfer::{
    file_name_for_key, HttpDownloader, ObjectStoreUploader, FILE_NAME_METADATA_KEY,
    REMOTE_KEY_METADATA_KEY, URL_METADATA_KEY,
};
