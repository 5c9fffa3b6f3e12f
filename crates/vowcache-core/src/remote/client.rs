//! HTTP fetcher used by the content cache on a miss.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::FetchError;

/// HTTP request timeout in seconds.
/// Image downloads on mobile links can be slow; the cache never blocks first
/// paint, so a generous timeout only delays the background publish.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Source of remote bytes for the content cache.
///
/// Implementations must treat `fetch` as a single idempotent GET. The cache
/// guarantees at most one call per cache key is in flight at any time.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// reqwest-backed fetcher.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(FetchError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url, "GET");
        let response = self.client.get(url).send().await?;
        let response = Self::check_response(response).await?;
        let bytes = response.bytes().await?;
        debug!(url, bytes = bytes.len(), "GET complete");
        Ok(bytes.to_vec())
    }
}
