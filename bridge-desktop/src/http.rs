//! `HttpClient` backed by reqwest.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse},
};
use futures_util::TryStreamExt;
use reqwest::{Client, Method};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared reqwest client for the archive API and document sources.
///
/// One attempt per call. Timeouts, refused connections and bodies cut off
/// mid-transfer come back as [`BridgeError::Transient`] so the caller's retry
/// policy decides what happens next; HTTP statuses are returned untouched.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(60))
    }

    /// Client whose requests time out after `timeout` unless the request
    /// carries its own.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("archive-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Head => Method::HEAD,
        }
    }

    fn transport_error(e: reqwest::Error) -> BridgeError {
        if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
            BridgeError::Transient(e.to_string())
        } else {
            BridgeError::OperationFailed(e.to_string())
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "HTTP request");

        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.client.request(Self::method(method), &url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(%method, %url, error = %e, "HTTP request failed");
            Self::transport_error(e)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let body = response.bytes().await.map_err(Self::transport_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn download_stream(&self, url: String) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(BridgeError::from_status(status, url));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(ReqwestHttpClient::method(HttpMethod::Head), Method::HEAD);
        assert_eq!(ReqwestHttpClient::method(HttpMethod::Put), Method::PUT);
        assert_eq!(ReqwestHttpClient::method(HttpMethod::Delete), Method::DELETE);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let client = ReqwestHttpClient::with_timeout(Duration::from_secs(2)).unwrap();
        let request = HttpRequest::new(HttpMethod::Get, "http://127.0.0.1:1/unreachable");

        let err = client.execute(request).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error class: {err}");
    }

    #[tokio::test]
    async fn test_stream_connection_refused_is_transient() {
        let client = ReqwestHttpClient::with_timeout(Duration::from_secs(2)).unwrap();
        let err = match client
            .download_stream("http://127.0.0.1:1/doc.pdf".to_string())
            .await
        {
            Ok(_) => panic!("expected connection failure"),
            Err(e) => e,
        };
        assert!(err.is_retryable(), "unexpected error class: {err}");
    }
}
