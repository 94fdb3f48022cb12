//! In-process object store

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{sha256_hex, ObjectMetadata, ObjectStat, ObjectStore, HASH_METADATA_KEY},
};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// [`ObjectStore`] held entirely in memory.
///
/// Strongly consistent, which makes it the reference store for tests of the
/// lock and sync layers.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Bytes, ObjectMetadata)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, mut metadata: ObjectMetadata) -> Result<()> {
        metadata.insert(HASH_METADATA_KEY.to_string(), sha256_hex(&data));
        self.objects
            .write()
            .await
            .insert(key.to_string(), (data, metadata));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BridgeError::NotFound(key.to_string()))
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>> {
        Ok(self.objects.read().await.get(key).map(|(data, metadata)| ObjectStat {
            key: key.to_string(),
            hash: metadata.get(HASH_METADATA_KEY).cloned(),
            size: data.len() as u64,
            metadata: metadata.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
