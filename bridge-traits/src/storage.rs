//! Remote Object Store Abstraction
//!
//! Key/value blob storage against the remote archive. Every other component
//! that touches the archive goes through [`ObjectStore`].

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::Result;

/// Metadata entry under which every store records the payload's SHA-256.
pub const HASH_METADATA_KEY: &str = "sha256";

/// Free-form string metadata attached to an object.
pub type ObjectMetadata = HashMap<String, String>;

/// Result of a `stat` call: everything known about an object without its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub key: String,
    /// Hex SHA-256 of the payload, when the store recorded one.
    pub hash: Option<String>,
    pub size: u64,
    pub metadata: ObjectMetadata,
}

/// Remote object store trait
///
/// Implementations must classify failures through
/// [`BridgeError`](crate::error::BridgeError): a missing object on `get` is
/// `NotFound`, throttling and 5xx are `Transient`, authorization failures
/// are `Permanent`.
///
/// The store is assumed eventually consistent. Callers verify by hash, never
/// by trusting a read-after-write.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::ObjectStore;
///
/// async fn remote_hash(store: &dyn ObjectStore) -> Result<Option<String>> {
///     Ok(store.stat("db/archive.sqlite").await?.and_then(|s| s.hash))
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `data` under `key`, replacing any previous object.
    ///
    /// Implementations add [`HASH_METADATA_KEY`] to the stored metadata.
    async fn put(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> Result<()>;

    /// Read the full object body.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Fetch object metadata without the body. `Ok(None)` when absent.
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
