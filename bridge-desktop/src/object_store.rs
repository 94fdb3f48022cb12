//! Directory-backed object store
//!
//! Maps object keys to files under a root directory. Used for dry runs and
//! as the developer-machine fallback when no remote archive is configured.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{sha256_hex, ObjectMetadata, ObjectStat, ObjectStore, HASH_METADATA_KEY},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const SIDECAR_SUFFIX: &str = ".meta.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    #[serde(default)]
    metadata: ObjectMetadata,
}

/// Local filesystem implementation of [`ObjectStore`]
///
/// - Object bodies live at `<root>/<key>`
/// - Metadata (including the payload hash) lives in a `<key>.meta.json` sidecar
/// - Writes go to a temp file in the same directory and are renamed into place
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform data directory used when no store root is configured.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join("archive-pipeline")
            .join("store")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with(SIDECAR_SUFFIX)
            && relative.components().all(|c| match c {
                Component::Normal(part) => !part.to_string_lossy().starts_with('.'),
                _ => false,
            });

        if !valid {
            return Err(BridgeError::Permanent(format!("Invalid object key: {:?}", key)));
        }

        Ok(self.root.join(relative))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| BridgeError::Permanent(format!("No parent for {:?}", path)))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(
            ".{}.tmp-{}-{}",
            file_name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_object_file(name: &str) -> bool {
        !name.starts_with('.') && !name.ends_with(SIDECAR_SUFFIX)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Bytes, mut metadata: ObjectMetadata) -> Result<()> {
        let path = self.object_path(key)?;
        metadata.insert(HASH_METADATA_KEY.to_string(), sha256_hex(&data));

        Self::write_atomic(&path, &data).await?;

        let sidecar = Sidecar {
            size: data.len() as u64,
            metadata,
        };
        let encoded = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| BridgeError::OperationFailed(format!("Sidecar encoding failed: {}", e)))?;
        Self::write_atomic(&Self::sidecar_path(&path), &encoded).await?;

        debug!(key, size = data.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BridgeError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>> {
        let path = self.object_path(key)?;
        let file_meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut metadata = match fs::read(Self::sidecar_path(&path)).await {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw)
                .map(|s| s.metadata)
                .unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectMetadata::new(),
            Err(e) => return Err(e.into()),
        };

        // Body written without a sidecar (crash between the two renames).
        if !metadata.contains_key(HASH_METADATA_KEY) {
            let data = fs::read(&path).await?;
            metadata.insert(HASH_METADATA_KEY.to_string(), sha256_hex(&data));
        }

        Ok(Some(ObjectStat {
            key: key.to_string(),
            hash: metadata.get(HASH_METADATA_KEY).cloned(),
            size: file_meta.len(),
            metadata,
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        Self::remove_if_exists(&path).await?;
        Self::remove_if_exists(&Self::sidecar_path(&path)).await?;
        debug!(key, "Deleted object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                if !Self::is_object_file(&name) {
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
