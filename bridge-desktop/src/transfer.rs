//! Default transfer collaborators
//!
//! [`HttpDownloader`] streams source documents to a local directory;
//! [`ObjectStoreUploader`] archives local files through any [`ObjectStore`].

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::HttpClient,
    storage::ObjectStore,
    transfer::{Downloader, Uploader},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Metadata entry overriding the URL a job is fetched from (defaults to the key).
pub const URL_METADATA_KEY: &str = "url";
/// Metadata entry overriding the local/remote file name.
pub const FILE_NAME_METADATA_KEY: &str = "file_name";
/// Metadata entry overriding the full remote key an upload is stored under.
pub const REMOTE_KEY_METADATA_KEY: &str = "remote_key";

/// Replace anything outside `[A-Za-z0-9._-]` so a job key becomes a safe file name.
pub fn file_name_for_key(key: &str) -> String {
    let name: String = key
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    name.trim_start_matches('.').to_string()
}

/// Downloads documents over HTTP into a local directory.
pub struct HttpDownloader {
    http_client: Arc<dyn HttpClient>,
    download_dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(http_client: Arc<dyn HttpClient>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            http_client,
            download_dir: download_dir.into(),
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip(self, metadata))]
    async fn fetch(&self, key: &str, metadata: &HashMap<String, String>) -> Result<PathBuf> {
        let url = metadata
            .get(URL_METADATA_KEY)
            .cloned()
            .unwrap_or_else(|| key.to_string());
        let file_name = metadata
            .get(FILE_NAME_METADATA_KEY)
            .cloned()
            .unwrap_or_else(|| file_name_for_key(key));
        if file_name.is_empty() {
            return Err(BridgeError::Permanent(format!("No file name for job {}", key)));
        }

        fs::create_dir_all(&self.download_dir).await?;
        let target = self.download_dir.join(&file_name);
        let partial = self.download_dir.join(format!(".{}.partial", file_name));

        let mut reader = self.http_client.download_stream(url).await?;
        let mut file = fs::File::create(&partial).await?;
        let written = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&partial).await;
                return Err(BridgeError::Transient(format!("Download interrupted: {}", e)));
            }
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&partial, &target).await?;
        debug!(bytes = written, path = ?target, "Downloaded document");
        Ok(target)
    }
}

/// Archives local files by writing them into an [`ObjectStore`] under a prefix.
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn remote_key(&self, local_path: &Path, metadata: &HashMap<String, String>) -> Result<String> {
        if let Some(key) = metadata.get(REMOTE_KEY_METADATA_KEY) {
            return Ok(key.clone());
        }

        let name = metadata
            .get(FILE_NAME_METADATA_KEY)
            .cloned()
            .or_else(|| {
                local_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .ok_or_else(|| {
                BridgeError::Permanent(format!("No file name in {:?}", local_path))
            })?;

        let prefix = self.prefix.trim_end_matches('/');
        Ok(if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        })
    }
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    #[instrument(skip(self, metadata))]
    async fn archive(
        &self,
        local_path: &Path,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let key = self.remote_key(local_path, metadata)?;
        let data = match fs::read(local_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BridgeError::Permanent(format!(
                    "Local file missing: {}",
                    local_path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let mut object_metadata = metadata.clone();
        object_metadata.remove(REMOTE_KEY_METADATA_KEY);
        self.store
            .put(&key, Bytes::from(data), object_metadata)
            .await?;

        debug!(key = %key, "Archived file");
        Ok(key)
    }
}
