use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use super::types::{FeedUrl, RawDocument};
use crate::config::{ConfigError, EngineConfig};
use crate::error::ErrorKind;

/// Errors that can occur while retrieving a document.
///
/// A fetch either yields the complete body or one of these; partial bytes are
/// never returned.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Attempt exceeded the configured deadline
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the configured size limit
    #[error("Response too large (limit {limit} bytes)")]
    ResponseTooLarge { limit: usize },
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// A redirect pointed somewhere the host policy forbids, looped, or
    /// went on too long
    #[error("Redirect refused: {0}")]
    RedirectRefused(String),
    /// The fetcher was shut down before a connection slot became free
    #[error("Fetcher is shut down")]
    Closed,
}

impl FetchError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_redirect() {
            let reason = std::error::Error::source(&err)
                .map_or_else(|| err.to_string(), ToString::to_string);
            Self::RedirectRefused(reason)
        } else {
            Self::Network(err)
        }
    }

    /// Connection failures, timeouts and truncated bodies are retried.
    /// HTTP statuses (including 5xx and 429) are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::IncompleteResponse { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::IncompleteResponse { .. } => ErrorKind::Network,
            Self::HttpStatus(_) => ErrorKind::HttpStatus,
            Self::Timeout => ErrorKind::Timeout,
            Self::ResponseTooLarge { .. } => ErrorKind::ResponseTooLarge,
            Self::RedirectRefused(_) => ErrorKind::InvalidUrl,
            Self::Closed => ErrorKind::Aborted,
        }
    }
}

/// Timeout, retry and size limits applied to every fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_bytes: usize,
}

impl FetchPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
            max_bytes: config.max_feed_bytes,
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// HTTP retrieval with a deadline, bounded retries and a global concurrency cap.
///
/// Clones share the client and the permit pool, so the cap holds across every
/// request made through any clone.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
    permits: Arc<Semaphore>,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, policy: FetchPolicy, max_concurrent: usize) -> Self {
        Self {
            client,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.http_client()?,
            FetchPolicy::from_config(config),
            config.max_concurrent_fetches,
        ))
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetches `url`, retrying transient failures with exponential backoff.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] / [`FetchError::Timeout`] - after retries are exhausted
    /// - [`FetchError::HttpStatus`] - non-2xx response, never retried
    /// - [`FetchError::ResponseTooLarge`] - body exceeds `max_bytes`
    /// - [`FetchError::Closed`] - [`Fetcher::close`] was called
    pub async fn fetch(&self, url: &FeedUrl) -> Result<RawDocument, FetchError> {
        let (bytes, content_type) = self.fetch_bytes(url.as_str()).await?;
        Ok(RawDocument {
            url: url.clone(),
            bytes,
            content_type,
            fetched_at: chrono::Utc::now(),
        })
    }

    /// Same policy as [`Fetcher::fetch`] for URLs that are not feeds
    /// (discovery pages, item pages).
    pub async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let mut retry = 0;

        loop {
            let result = {
                // Hold a permit only while on the wire, not while backing off
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| FetchError::Closed)?;
                tokio::time::timeout(self.policy.timeout, self.attempt(url))
                    .await
                    .unwrap_or(Err(FetchError::Timeout))
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && retry < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry);
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, attempts = retry + 1, "Fetch failed");
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, url: &str) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = read_limited_bytes(response, self.policy.max_bytes).await?;
        Ok((bytes, content_type))
    }

    /// Stops handing out connection slots. Waiting and future fetches fail
    /// with [`FetchError::Closed`]; transfers already on the wire finish.
    pub fn close(&self) {
        self.permits.close();
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge { limit });
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    // A connection dropped mid-body can end the stream early without an error
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
