//! Minimal JSON-over-HTTP GET client.
//!
//! Both remote authorities speak plain HTTP/1.1 with JSON bodies, so a
//! pooled hyper client plus a per-request timeout is all we need.

use std::time::Duration;

use bytes::Bytes;
use http::{StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{LockError, LockResult};

/// A response that arrived, successful or not.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Fetched {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Pooled HTTP client shared by the lock and results clients.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpFetcher {
    /// Create a client with a per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    /// GET `uri` and buffer the whole body.
    ///
    /// Only transport problems are errors; any HTTP status is returned.
    pub async fn get(&self, uri: &str) -> LockResult<Fetched> {
        let parsed: Uri = uri.parse().map_err(|e: http::uri::InvalidUri| LockError::InvalidUri {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;

        let result = tokio::time::timeout(self.timeout, async {
            let response = self.client.get(parsed).await.map_err(|e| LockError::Http {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| LockError::Http {
                    uri: uri.to_string(),
                    message: e.to_string(),
                })?
                .to_bytes();

            Ok::<_, LockError>(Fetched { status, body })
        })
        .await;

        match result {
            Ok(fetched) => {
                if let Ok(f) = &fetched {
                    debug!(%uri, status = %f.status, bytes = f.body.len(), "GET");
                }
                fetched
            }
            Err(_) => Err(LockError::Timeout(uri.to_string())),
        }
    }

    /// GET `uri` and decode a 2xx JSON body; non-2xx is [`LockError::Status`].
    pub async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> LockResult<T> {
        let fetched = self.get(uri).await?;
        if !fetched.is_success() {
            return Err(LockError::Status {
                uri: uri.to_string(),
                status: fetched.status.as_u16(),
            });
        }
        serde_json::from_slice(&fetched.body).map_err(|source| LockError::Decode {
            uri: uri.to_string(),
            source,
        })
    }
}

/// Join a base URL and path segments into `{base}/{seg}/.../`.
///
/// Segments are percent-encoded. The lock and results services both
/// expect a trailing slash.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(&urlencoding::encode(segment.trim_matches('/')));
    }
    url.push('/');
    url
}
