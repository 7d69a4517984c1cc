use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{SearchError, SearchHit, SearchSource};

/// Responses larger than this are treated as a broken directory.
const MAX_RESPONSE_SIZE: usize = 2 * 1024 * 1024;

/// A remote feed directory answering `GET {endpoint}?q={query}` with
/// `{"results": [{"title", "url", "score", "description", "siteUrl"}]}`.
pub struct RemoteDirectory {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    results: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    #[serde(alias = "feedUrl", alias = "feed_url")]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "siteUrl", alias = "site_url")]
    site: String,
}

impl RemoteDirectory {
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key: api_key.map(SecretString::from),
            timeout,
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, SearchError> {
        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_SIZE as u64)
        {
            return Err(SearchError::Unavailable("directory response too large".into()));
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SearchError::Unavailable(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > MAX_RESPONSE_SIZE {
                return Err(SearchError::Unavailable("directory response too large".into()));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl SearchSource for RemoteDirectory {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("q", query);

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| SearchError::Unavailable("directory request timed out".into()))?
            .map_err(|e| SearchError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Unavailable(format!(
                "directory returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = tokio::time::timeout(self.timeout, Self::read_body(response))
            .await
            .map_err(|_| SearchError::Unavailable("directory request timed out".into()))??;
        let parsed: DirectoryResponse = serde_json::from_slice(&body)
            .map_err(|e| SearchError::Unavailable(format!("unreadable directory response: {e}")))?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|e| !e.url.trim().is_empty())
            .map(|e| SearchHit {
                feed_url: e.url.trim().to_owned(),
                title: e.title,
                score: e.score.unwrap_or(0.0),
                description: e.description,
                site_url: e.site,
            })
            .collect())
    }
}
