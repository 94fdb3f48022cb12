//! Transfer Collaborators
//!
//! Contracts for the two classes of orchestrated work: fetching a source
//! document to local disk and archiving a local file remotely.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Fetches one document to local disk.
///
/// Transient network failures must surface as retryable errors
/// ([`BridgeError::Transient`](crate::error::BridgeError::Transient) or a
/// retryable IO error); a document that no longer exists is `NotFound` or
/// `Permanent`.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the document identified by `key` and return its local path.
    async fn fetch(&self, key: &str, metadata: &HashMap<String, String>) -> Result<PathBuf>;
}

/// Archives a local file to the remote store.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `local_path` and return the remote identifier it was stored under.
    async fn archive(&self, local_path: &Path, metadata: &HashMap<String, String>)
        -> Result<String>;
}
