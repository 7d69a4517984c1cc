//! Feed search: resolve a query to candidate feed URLs.
//!
//! A query that is itself an http(s) URL runs discovery against that page.
//! Anything else goes to the configured [`SearchSource`]: a remote directory,
//! or the [`LocalIndex`] of feeds this engine has parsed. Hits come back in
//! descending score order; equal scores keep the source's order.

pub mod discovery;
mod local;
mod remote;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use local::LocalIndex;
pub use remote::RemoteDirectory;

use crate::error::ErrorKind;
use crate::feed::{FeedUrl, Fetcher};
use crate::util::{HostPolicy, MAX_SEARCH_QUERY_LENGTH, MIN_SEARCH_QUERY_LENGTH};

/// Distinct queries whose results are kept.
const RESULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SearchError {
    /// Query empty, too short/long, or an unacceptable URL
    #[error("Invalid search query: {0}")]
    InvalidQuery(String),
    /// The discovery source could not be reached or answered nonsense
    #[error("Search unavailable: {0}")]
    Unavailable(String),
}

impl SearchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Self::Unavailable(_) => ErrorKind::SearchUnavailable,
        }
    }
}

/// One candidate feed. Generated per query; no identity beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub feed_url: String,
    pub title: String,
    /// Relevance, higher first. Never NaN.
    pub score: f64,
    pub description: String,
    pub site_url: String,
}

/// Where free-text queries are answered.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether results may be reused for the result-cache TTL. Sources that
    /// change with every parsed feed should say no.
    fn cacheable(&self) -> bool {
        true
    }

    /// Hits in the source's own order. Zero matches is `Ok(vec![])`.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}

struct CachedHits {
    hits: Vec<SearchHit>,
    stored: Instant,
}

/// Validates queries, routes them, ranks and caches the results.
pub struct SearchIndex {
    source: Arc<dyn SearchSource>,
    fetcher: Fetcher,
    policy: HostPolicy,
    cache_ttl: Duration,
    cache: Mutex<LruCache<String, CachedHits>>,
}

impl SearchIndex {
    pub fn new(
        source: Arc<dyn SearchSource>,
        fetcher: Fetcher,
        policy: HostPolicy,
        cache_ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(RESULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            fetcher,
            policy,
            cache_ttl,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Runs `query`.
    ///
    /// # Errors
    ///
    /// - [`SearchError::InvalidQuery`] - blank, shorter than 2 or longer than 100 characters
    /// - [`SearchError::Unavailable`] - the source or the discovery page is unreachable
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let query = normalize_query(query)?;
        // URL paths are case-sensitive; free text is not
        let page = if is_url_query(query) {
            Some(FeedUrl::parse(query, self.policy).map_err(|e| {
                SearchError::InvalidQuery(format!("cannot discover feeds at {query}: {e}"))
            })?)
        } else {
            None
        };
        let cache_key = match &page {
            Some(url) => format!("url:{url}"),
            None => format!("text:{}", query.to_lowercase()),
        };

        if let Some(hits) = self.cached(&cache_key) {
            tracing::debug!(query = %query, "Search result cache hit");
            return Ok(hits);
        }

        let (hits, cacheable) = if let Some(url) = &page {
            (discovery::discover(&self.fetcher, url.as_str(), self.policy).await?, true)
        } else {
            (self.source.search(query).await?, self.source.cacheable())
        };
        let hits = rank(hits);
        tracing::debug!(query = %query, source = self.source.name(), hits = hits.len(), "Search completed");

        if cacheable && !self.cache_ttl.is_zero() {
            self.cache.lock().unwrap_or_else(PoisonError::into_inner).put(
                cache_key,
                CachedHits {
                    hits: hits.clone(),
                    stored: Instant::now(),
                },
            );
        }
        Ok(hits)
    }

    fn cached(&self, key: &str) -> Option<Vec<SearchHit>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = cache
            .get(key)
            .map(|c| (c.stored.elapsed() < self.cache_ttl).then(|| c.hits.clone()))?;
        if fresh.is_none() {
            cache.pop(key);
        }
        fresh
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn normalize_query(query: &str) -> Result<&str, SearchError> {
    let trimmed = query.trim();
    let len = trimmed.chars().count();
    if len < MIN_SEARCH_QUERY_LENGTH {
        return Err(SearchError::InvalidQuery(format!(
            "query must be at least {MIN_SEARCH_QUERY_LENGTH} characters"
        )));
    }
    if len > MAX_SEARCH_QUERY_LENGTH {
        return Err(SearchError::InvalidQuery(format!(
            "query must be at most {MAX_SEARCH_QUERY_LENGTH} characters"
        )));
    }
    Ok(trimmed)
}

fn is_url_query(query: &str) -> bool {
    let lower = query.to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://")) && !query.contains(char::is_whitespace)
}

/// Descending score, stable for ties. NaN scores count as 0.
fn rank(mut hits: Vec<SearchHit>) -> Vec<SearchHit> {
    for hit in &mut hits {
        // Also folds -0.0 into 0.0 so the two never split a tie
        if hit.score.is_nan() || hit.score == 0.0 {
            hit.score = 0.0;
        }
    }
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchPolicy;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        hits: Vec<SearchHit>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchSource for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.hits.clone())
        }
    }

    struct Down;

    #[async_trait]
    impl SearchSource for Down {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, SearchError> {
            Err(SearchError::Unavailable("connection refused".into()))
        }
    }

    fn hit(url: &str, score: f64) -> SearchHit {
        SearchHit {
            feed_url: url.into(),
            title: url.into(),
            score,
            description: String::new(),
            site_url: String::new(),
        }
    }

    fn index(source: Arc<dyn SearchSource>, ttl: Duration) -> SearchIndex {
        let policy = FetchPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 0,
            backoff: Duration::from_millis(1),
            max_bytes: 1024,
        };
        SearchIndex::new(
            source,
            Fetcher::new(reqwest::Client::new(), policy, 1),
            HostPolicy::PublicOnly,
            ttl,
        )
    }

    #[test]
    fn test_rank_orders_by_score_and_keeps_ties_stable() {
        let ranked = rank(vec![
            hit("a", 0.5),
            hit("b", 0.9),
            hit("c", 0.5),
            hit("d", f64::NAN),
            hit("e", 0.9),
        ]);
        let urls: Vec<_> = ranked.iter().map(|h| h.feed_url.as_str()).collect();
        assert_eq!(urls, vec!["b", "e", "a", "c", "d"]);
        assert_eq!(ranked[4].score, 0.0);
    }

    #[test]
    fn test_query_validation() {
        assert!(normalize_query("  ").is_err());
        assert!(normalize_query("a").is_err());
        assert_eq!(normalize_query("  ab ").unwrap(), "ab");
        assert!(normalize_query(&"x".repeat(100)).is_ok());
        assert!(normalize_query(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_url_query_detection() {
        assert!(is_url_query("https://example.com"));
        assert!(is_url_query("HTTP://example.com/blog"));
        assert!(!is_url_query("rust https://example.com"));
        assert!(!is_url_query("example.com"));
    }

    #[tokio::test]
    async fn test_results_cached_per_query() {
        let source = Arc::new(Fixed {
            hits: vec![hit("a", 0.1), hit("b", 0.7)],
            calls: AtomicUsize::new(0),
        });
        let index = index(source.clone(), Duration::from_secs(60));

        let first = index.search("Rust").await.unwrap();
        let second = index.search("  rust ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].feed_url, "b");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        index.clear_cache();
        index.search("rust").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let source = Arc::new(Fixed {
            hits: vec![],
            calls: AtomicUsize::new(0),
        });
        let index = index(source.clone(), Duration::ZERO);
        assert!(index.search("rust").await.unwrap().is_empty());
        index.search("rust").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_source_propagates() {
        let err = index(Arc::new(Down), Duration::from_secs(60))
            .search("rust")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SearchUnavailable);
    }

    #[tokio::test]
    async fn test_invalid_query_never_reaches_source() {
        let source = Arc::new(Fixed {
            hits: vec![],
            calls: AtomicUsize::new(0),
        });
        let err = index(source.clone(), Duration::from_secs(60))
            .search(" x ")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_url_queries_cached_case_sensitively() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<rss version="2.0"><channel><title>Upper</title></channel></rss>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><head><title>No feeds</title></head></html>")
                    .insert_header("content-type", "text/html"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = Arc::new(Fixed {
            hits: vec![],
            calls: AtomicUsize::new(0),
        });
        let policy = FetchPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 0,
            backoff: Duration::from_millis(1),
            max_bytes: 64 * 1024,
        };
        let index = SearchIndex::new(
            source.clone(),
            Fetcher::new(reqwest::Client::new(), policy, 2),
            HostPolicy::AllowPrivate,
            Duration::from_secs(60),
        );

        let upper = index.search(&format!("{}/Feed", server.uri())).await.unwrap();
        assert_eq!(upper.len(), 1);
        assert_eq!(upper[0].feed_url, format!("{}/Feed", server.uri()));

        let lower = index.search(&format!("{}/feed", server.uri())).await.unwrap();
        assert!(lower.is_empty());

        // Same page again is a cache hit
        let again = index.search(&format!("{}/Feed", server.uri())).await.unwrap();
        assert_eq!(again, upper);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn prop_rank_is_sorted_permutation(scores in proptest::collection::vec(-10.0f64..10.0, 0..30)) {
            let hits: Vec<_> = scores.iter().enumerate().map(|(i, s)| hit(&i.to_string(), *s)).collect();
            let ranked = rank(hits.clone());
            prop_assert_eq!(ranked.len(), hits.len());
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
                if pair[0].score == pair[1].score {
                    let a: usize = pair[0].feed_url.parse().unwrap();
                    let b: usize = pair[1].feed_url.parse().unwrap();
                    prop_assert!(a < b);
                }
            }
        }
    }
}
