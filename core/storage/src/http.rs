//! REST transport over HTTP.
//!
//! Maps the CRUD vocabulary onto conventional REST routes:
//! `POST {base}/{group}`, `GET {base}/{group}[/{id}]`,
//! `PUT {base}/{group}/{id}` and `DELETE {base}/{group}/{id}`.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::remote::{RemoteRequest, RemoteTransport};
use dualstore_common::{Error, Method, Result};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport to a REST API.
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    /// Create a transport rooted at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not an absolute http(s) URL
    /// - The HTTP client cannot be built
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a transport with a custom request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Validation(format!("Invalid remote URL {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "Remote URL must be http(s): {}",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent("DualStore/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Validation(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    /// Base URL of the API.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve the endpoint of a request.
    pub fn endpoint(&self, request: &RemoteRequest) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Validation(format!("Invalid remote URL {}", self.base)))?;
            segments.pop_if_empty().push(request.store_group.as_str());
            if let Some(id) = &request.id {
                segments.push(id);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RemoteTransport for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: RemoteRequest) -> Result<Value> {
        let url = self.endpoint(&request)?;
        debug!("{} {}", request.method, url);

        let builder = match request.method {
            Method::Create => self.http.post(url),
            Method::Read => self.http.get(url),
            Method::Update => self.http.put(url),
            Method::Delete => self.http.delete(url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            // No response reached us: report status 0.
            .map_err(|e| Error::remote(0, format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            // The remote answered, so it may already have applied the request.
            .map_err(|e| {
                Error::remote(status.as_u16(), format!("Failed to read response: {}", e))
            })?;

        if !status.is_success() {
            return Err(Error::remote(status.as_u16(), body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualstore_common::StoreGroup;
    use serde_json::json;

    fn customers() -> StoreGroup {
        StoreGroup::new("customers").unwrap()
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(HttpRemote::new("ftp://example.com").is_err());
        assert!(HttpRemote::new("not a url").is_err());
    }

    #[test]
    fn test_collection_endpoint() {
        let remote = HttpRemote::new("https://api.example.com/v1/").unwrap();
        let url = remote
            .endpoint(&RemoteRequest::create(customers(), json!({})))
            .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/customers");
    }

    #[test]
    fn test_entity_endpoint_is_encoded() {
        let remote = HttpRemote::new("https://api.example.com/v1").unwrap();
        let url = remote
            .endpoint(&RemoteRequest::delete(customers(), "a b/c"))
            .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/customers/a%20b%2Fc");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_status_zero() {
        let remote =
            HttpRemote::with_timeout("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = remote
            .send(RemoteRequest::read_all(customers()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(0));
    }

    #[tokio::test]
    async fn test_truncated_body_keeps_status() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n[{\"id\"")
                .await
                .unwrap();
        });

        let remote = HttpRemote::new(&format!("http://{}", addr)).unwrap();
        let err = remote
            .send(RemoteRequest::read_all(customers()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(200));
    }
}
