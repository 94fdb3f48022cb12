//! Archive API connector implementation
//!
//! Implements the `ObjectStore` trait over a plain HTTP object API.

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::storage::{
    sha256_hex, ObjectMetadata, ObjectStat, ObjectStore, HASH_METADATA_KEY,
};
use bytes::Bytes;
use core_runtime::config::RemoteStoreConfig;
use core_runtime::logging::redact_if_sensitive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::StoreError;
use crate::types::ListResponse;

/// Header prefix carrying object metadata
const META_HEADER_PREFIX: &str = "x-object-meta-";

/// Upper bound on list pages followed before giving up
const MAX_LIST_PAGES: usize = 10_000;

/// HTTP object store connector
///
/// Implements `ObjectStore` against the remote archive.
///
/// # Wire format
///
/// - `PUT {base}/{key}` with the body and `x-object-meta-*` headers
/// - `GET {base}/{key}` / `HEAD {base}/{key}` / `DELETE {base}/{key}`
/// - `GET {base}?prefix={prefix}[&marker={marker}]` returning `{"keys": [...], "next_marker": ...}`
/// - `Authorization: LOW {access}:{secret}` when credentials are configured
///
/// Statuses are mapped with [`BridgeError::from_status`]; the connector makes
/// one attempt per call and leaves retrying to the caller.
///
/// # Example
///
/// ```ignore
/// use provider_http_store::HttpObjectStore;
/// use bridge_traits::storage::ObjectStore;
///
/// let store = HttpObjectStore::new(http_client, "https://archive.example/bucket");
/// let stat = store.stat("db/archive.sqlite").await?;
/// ```
pub struct HttpObjectStore {
    /// HTTP client for API requests
    http_client: Arc<dyn HttpClient>,

    /// Base URL without trailing slash
    base_url: String,

    /// `access:secret` pair
    credentials: Option<(String, String)>,

    /// Per-request timeout
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("base_url", &self.base_url)
            .field(
                "credentials",
                &self
                    .credentials
                    .as_ref()
                    .map(|(access, secret)| (access.clone(), redact_if_sensitive("secret", secret))),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HttpObjectStore {
    /// Create a connector without credentials
    pub fn new(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Create a connector from validated remote store settings
    pub fn from_config(http_client: Arc<dyn HttpClient>, config: &RemoteStoreConfig) -> Self {
        let mut store = Self::new(http_client, config.base_url.clone());
        if let (Some(access), Some(secret)) = (&config.access_key, &config.secret_key) {
            store = store.with_credentials(access.clone(), secret.clone());
        }
        store.with_timeout(config.request_timeout)
    }

    pub fn with_credentials(mut self, access: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some((access.into(), secret.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the URL of one object, percent-encoding each path segment
    fn object_url(&self, key: &str) -> std::result::Result<String, StoreError> {
        if key.is_empty() || key.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        let encoded = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("{}/{}", self.base_url, encoded))
    }

    fn request(&self, method: HttpMethod, url: String) -> HttpRequest {
        let mut request = HttpRequest::new(method, url).timeout(self.request_timeout);
        if let Some((access, secret)) = &self.credentials {
            request = request.header("Authorization", format!("LOW {}:{}", access, secret));
        }
        request
    }

    /// Fail with the status-mapped error unless the response is 2xx
    fn check(response: HttpResponse, context: &str) -> std::result::Result<HttpResponse, StoreError> {
        if response.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .ok()
            .filter(|body| !body.trim().is_empty())
            .map(|body| format!("{}: {}", context, body.trim()))
            .unwrap_or_else(|| context.to_string());

        Err(StoreError::ApiError {
            status_code: response.status,
            message,
        })
    }

    /// Collect `x-object-meta-*` headers into object metadata
    fn metadata_from_headers(response: &HttpResponse) -> ObjectMetadata {
        response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                let lower = name.to_ascii_lowercase();
                lower
                    .strip_prefix(META_HEADER_PREFIX)
                    .map(|k| (k.to_string(), value.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(skip(self, data, metadata), fields(size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, mut metadata: ObjectMetadata) -> Result<()> {
        let url = self.object_url(key)?;
        metadata.insert(HASH_METADATA_KEY.to_string(), sha256_hex(&data));

        let mut request = self
            .request(HttpMethod::Put, url)
            .header("Content-Type", "application/octet-stream")
            .body(data);
        for (name, value) in &metadata {
            request = request.header(format!("{}{}", META_HEADER_PREFIX, name), value.clone());
        }

        let response = self.http_client.execute(request).await?;
        Self::check(response, &format!("PUT {}", key))?;
        debug!("Object stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let url = self.object_url(key)?;
        let response = self.http_client.execute(self.request(HttpMethod::Get, url)).await?;
        if response.status == 404 {
            return Err(BridgeError::NotFound(key.to_string()));
        }
        Ok(Self::check(response, &format!("GET {}", key))?.body)
    }

    #[instrument(skip(self))]
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>> {
        let url = self.object_url(key)?;
        let response = self.http_client.execute(self.request(HttpMethod::Head, url)).await?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = Self::check(response, &format!("HEAD {}", key))?;

        let metadata = Self::metadata_from_headers(&response);
        let size = response.content_length().unwrap_or(0);

        Ok(Some(ObjectStat {
            key: key.to_string(),
            hash: metadata.get(HASH_METADATA_KEY).cloned(),
            size,
            metadata,
        }))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key)?;
        let response = self
            .http_client
            .execute(self.request(HttpMethod::Delete, url))
            .await?;
        if response.status == 404 {
            debug!("Delete of missing object");
            return Ok(());
        }
        Self::check(response, &format!("DELETE {}", key))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut marker: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut url = format!("{}?prefix={}", self.base_url, urlencoding::encode(prefix));
            if let Some(m) = &marker {
                url.push_str(&format!("&marker={}", urlencoding::encode(m)));
            }

            let response = self.http_client.execute(self.request(HttpMethod::Get, url)).await?;
            let response = Self::check(response, &format!("LIST {}", prefix))?;
            let page: ListResponse = serde_json::from_slice(&response.body)
                .map_err(|e| StoreError::ParseError(e.to_string()))?;

            keys.extend(page.keys.into_iter().filter(|k| k.starts_with(prefix)));

            match page.next_marker {
                Some(next) if marker.as_deref() != Some(next.as_str()) => marker = Some(next),
                _ => {
                    keys.sort();
                    keys.dedup();
                    return Ok(keys);
                }
            }
        }

        warn!(pages = MAX_LIST_PAGES, "List pagination did not terminate");
        Err(StoreError::ParseError(format!("List of {} did not terminate", prefix)).into())
    }
}
