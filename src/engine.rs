//! Request orchestration.
//!
//! Every parse request walks the same states:
//!
//! ```text
//! Validate -> CacheCheck -> Fetching -> Parsing -> Enriching? -> CacheWrite -> Done
//! ```
//!
//! A live cache hit jumps straight to Done. Any fetch or parse error ends the
//! request with nothing written to the cache. Item-level enrichment failures
//! and cache-write failures become [`Warning`]s on an otherwise successful
//! [`FeedReport`].
//!
//! Admission and shutdown share one `watch` channel holding the open flag and
//! the in-flight count, so a request is either counted before `close` looks
//! at the count or is refused.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, EngineConfig};
use crate::enrich::{EnrichmentPipeline, ItemFailure};
use crate::error::Error;
use crate::feed::{self, Feed, FeedUrl, FetchPolicy, Fetcher};
use crate::search::{LocalIndex, RemoteDirectory, SearchHit, SearchIndex, SearchSource};
use crate::storage::{self, CacheError, CacheKey, CacheStats, CacheStore};

// ============================================================================
// Result types
// ============================================================================

/// The request state a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    Validate = 0,
    CacheCheck = 1,
    Fetching = 2,
    Parsing = 3,
    Enriching = 4,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::CacheCheck => "cache_check",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Enriching => "enriching",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::CacheCheck,
            2 => Self::Fetching,
            3 => Self::Parsing,
            4 => Self::Enriching,
            _ => Self::Validate,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that ended in the `Failed` state.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct Failure {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl Failure {
    fn new(stage: Stage, error: impl Into<Error>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// One item could not be enriched and is returned without enrichment
    ItemEnrichment,
    /// The result was computed but not stored
    CacheWrite,
    /// A secondary cache lookup failed; the feed was fetched instead
    CacheRead,
}

/// A non-fatal problem attached to a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub item_id: Option<String>,
    pub message: String,
}

impl Warning {
    fn cache_write(message: impl std::fmt::Display) -> Self {
        Self {
            kind: WarningKind::CacheWrite,
            item_id: None,
            message: message.to_string(),
        }
    }

    fn cache_read(message: impl std::fmt::Display) -> Self {
        Self {
            kind: WarningKind::CacheRead,
            item_id: None,
            message: message.to_string(),
        }
    }
}

impl From<ItemFailure> for Warning {
    fn from(failure: ItemFailure) -> Self {
        Self {
            kind: WarningKind::ItemEnrichment,
            message: format!("{}: {}", failure.step, failure.message),
            item_id: Some(failure.item_id),
        }
    }
}

/// A successful parse. The caller owns every value in it.
#[derive(Debug, Clone)]
pub struct FeedReport {
    pub feed: Feed,
    pub from_cache: bool,
    pub warnings: Vec<Warning>,
}

#[derive(Debug)]
pub struct BatchEntry {
    /// The URL exactly as submitted
    pub url: String,
    pub result: Result<FeedReport, Failure>,
}

/// One entry per submitted URL, in submission order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    /// Requests in flight when shutdown began
    pub in_flight: usize,
    /// Whether they all finished within the grace period
    pub drained: bool,
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Admission {
    open: bool,
    in_flight: usize,
}

/// Decrements the in-flight count when a request ends, however it ends.
struct InFlight<'a>(&'a watch::Sender<Admission>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0
            .send_modify(|a| a.in_flight = a.in_flight.saturating_sub(1));
    }
}

/// Last stage a request entered, for reporting aborts.
struct StageCell(AtomicU8);

impl StageCell {
    fn new() -> Self {
        Self(AtomicU8::new(Stage::Validate as u8))
    }

    fn set(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    fn get(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::Relaxed))
    }
}

struct Inner {
    config: EngineConfig,
    fetcher: Fetcher,
    cache: Arc<dyn CacheStore>,
    pipeline: EnrichmentPipeline,
    search: SearchIndex,
    local_index: Arc<LocalIndex>,
    admission: watch::Sender<Admission>,
    cancel: CancellationToken,
    shutdown: OnceCell<ShutdownSummary>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Stops the sweeper if the engine is dropped without close()
        self.cancel.cancel();
    }
}

/// The feed engine. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.inner.cache.backend())
            .field("search_source", &self.inner.search.source_name())
            .field("steps", &self.inner.pipeline.step_names())
            .finish()
    }
}

/// Assembles an [`Engine`], optionally with injected collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    cache: Option<Arc<dyn CacheStore>>,
    pipeline: Option<EnrichmentPipeline>,
    search_source: Option<Arc<dyn SearchSource>>,
    http_client: Option<reqwest::Client>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cache: None,
            pipeline: None,
            search_source: None,
            http_client: None,
        }
    }

    /// Use this store instead of the backend named in the config.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn pipeline(mut self, pipeline: EnrichmentPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn search_source(mut self, source: Arc<dyn SearchSource>) -> Self {
        self.search_source = Some(source);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Validates the config, opens the cache and starts the sweeper.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<Engine, Error> {
        let config = self.config;
        config.validate()?;

        let client = match self.http_client {
            Some(client) => client,
            None => config.http_client()?,
        };
        let fetcher = Fetcher::new(
            client,
            FetchPolicy::from_config(&config),
            config.max_concurrent_fetches,
        );

        let cache = match self.cache {
            Some(cache) => cache,
            None => storage::open(&config).await?,
        };
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| EnrichmentPipeline::standard(&config, &fetcher));

        let local_index = Arc::new(LocalIndex::new(config.memory_cache_capacity));
        let source: Arc<dyn SearchSource> = match (self.search_source, &config.search_endpoint) {
            (Some(source), _) => source,
            (None, Some(endpoint)) => {
                let endpoint = url::Url::parse(endpoint).map_err(|e| {
                    ConfigError::Invalid(format!("search_endpoint is not a valid URL: {e}"))
                })?;
                Arc::new(RemoteDirectory::new(
                    fetcher.client().clone(),
                    endpoint,
                    config.search_api_key.clone(),
                    config.fetch_timeout(),
                ))
            }
            (None, None) => local_index.clone(),
        };
        let search = SearchIndex::new(
            source,
            fetcher.clone(),
            config.host_policy(),
            Duration::from_secs(config.search_cache_ttl_secs),
        );

        let (admission, _) = watch::channel(Admission {
            open: true,
            in_flight: 0,
        });
        let cancel = CancellationToken::new();
        let sweeper = (config.cache_sweep_interval_secs > 0).then(|| {
            spawn_sweeper(
                cache.clone(),
                Duration::from_secs(config.cache_sweep_interval_secs),
                cancel.child_token(),
            )
        });

        tracing::info!(
            backend = ?cache.backend(),
            search = search.source_name(),
            max_concurrent_fetches = config.max_concurrent_fetches,
            "Feed engine ready"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                config,
                fetcher,
                cache,
                pipeline,
                search,
                local_index,
                admission,
                cancel,
                shutdown: OnceCell::new(),
                sweeper: Mutex::new(sweeper),
            }),
        })
    }
}

fn spawn_sweeper(
    cache: Arc<dyn CacheStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match cache.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Purged expired cache entries"),
                    Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
                },
            }
        }
    })
}

impl Engine {
    /// Builds an engine with the default collaborators for `config`.
    pub async fn new(config: EngineConfig) -> Result<Self, Error> {
        EngineBuilder::new(config).build().await
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.admission.borrow().open
    }

    /// Parses one feed, from cache when a live entry exists.
    ///
    /// # Errors
    ///
    /// The [`Error`] of the failed state; see [`Engine::parse_feed_detailed`]
    /// for the state itself.
    pub async fn parse_feed(&self, url: &str, enrich: bool) -> Result<FeedReport, Error> {
        self.parse_feed_detailed(url, enrich)
            .await
            .map_err(|f| f.error)
    }

    /// Like [`Engine::parse_feed`], reporting the failed state as well.
    pub async fn parse_feed_detailed(&self, url: &str, enrich: bool) -> Result<FeedReport, Failure> {
        let Some(_in_flight) = self.admit() else {
            return Err(Failure::new(Stage::Validate, Error::NotInitialized));
        };

        let stage = StageCell::new();
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => {
                tracing::warn!(url = %url, stage = %stage.get(), "Request aborted by shutdown");
                Err(Failure::new(stage.get(), Error::Aborted))
            }
            result = self.process(url, enrich, &stage) => result,
        }
    }

    /// The low-latency path: parse and cache, never enrich.
    pub async fn parse_feed_without_enrichment(&self, url: &str) -> Result<FeedReport, Error> {
        self.parse_feed(url, false).await
    }

    /// Parses every URL with enrichment; see [`Engine::parse_feeds_with`].
    pub async fn parse_feeds<S: AsRef<str>>(&self, urls: &[S]) -> BatchReport {
        self.parse_feeds_with(urls, true).await
    }

    /// Parses every URL independently with at most `max_concurrent_fetches`
    /// in progress. A failed URL becomes a failed entry and never affects its
    /// siblings. Entries come back in submission order regardless of which
    /// finished first.
    pub async fn parse_feeds_with<S: AsRef<str>>(&self, urls: &[S], enrich: bool) -> BatchReport {
        let mut slots: Vec<Option<BatchEntry>> = std::iter::repeat_with(|| None)
            .take(urls.len())
            .collect();

        let mut completions = stream::iter(0..urls.len())
            .map(|index| async move {
                let url = urls[index].as_ref();
                let result = self.parse_feed_detailed(url, enrich).await;
                (
                    index,
                    BatchEntry {
                        url: url.to_owned(),
                        result,
                    },
                )
            })
            .buffer_unordered(self.inner.config.max_concurrent_fetches.max(1));

        while let Some((index, entry)) = completions.next().await {
            slots[index] = Some(entry);
        }

        let report = BatchReport {
            entries: slots.into_iter().flatten().collect(),
        };
        tracing::info!(
            total = report.entries.len(),
            failed = report.failed(),
            "Batch parse finished"
        );
        report
    }

    /// Resolves `query` to candidate feeds.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, Error> {
        let Some(_in_flight) = self.admit() else {
            return Err(Error::NotInitialized);
        };
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(Error::Aborted),
            result = self.inner.search.search(query) => result.map_err(Error::from),
        }
    }

    /// Drops both cached slots of `url`. Returns whether anything was removed.
    pub async fn invalidate(&self, url: &str) -> Result<bool, Error> {
        let url = FeedUrl::parse(url, self.inner.config.host_policy())?;
        let raw = self
            .inner
            .cache
            .invalidate(&CacheKey::new(url.clone(), false))
            .await?;
        let enriched = self.inner.cache.invalidate(&CacheKey::new(url, true)).await?;
        Ok(raw || enriched)
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, Error> {
        Ok(self.inner.cache.stats().await?)
    }

    /// Stops admitting requests, waits up to `shutdown_grace_ms` for those in
    /// flight, aborts the rest, then stops the sweeper and closes the cache.
    ///
    /// Only the first call does anything; later calls return the same summary.
    pub async fn close(&self) -> ShutdownSummary {
        *self.inner.shutdown.get_or_init(|| self.shutdown()).await
    }

    async fn shutdown(&self) -> ShutdownSummary {
        let inner = &self.inner;
        let mut in_flight = 0;
        inner.admission.send_modify(|a| {
            a.open = false;
            in_flight = a.in_flight;
        });
        tracing::info!(in_flight, "Feed engine shutting down");

        let mut rx = inner.admission.subscribe();
        let drained = tokio::time::timeout(
            inner.config.shutdown_grace(),
            rx.wait_for(|a| a.in_flight == 0),
        )
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                grace_ms = inner.config.shutdown_grace_ms,
                "Grace period elapsed, aborting in-flight requests"
            );
        }

        inner.cancel.cancel();
        inner.fetcher.close();
        let sweeper = inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Cache sweeper ended abnormally");
            }
        }
        inner.cache.close().await;

        tracing::info!(drained, "Feed engine closed");
        ShutdownSummary { in_flight, drained }
    }

    fn admit(&self) -> Option<InFlight<'_>> {
        let admission = &self.inner.admission;
        admission
            .send_if_modified(|a| {
                if a.open {
                    a.in_flight += 1;
                    true
                } else {
                    false
                }
            })
            .then(|| InFlight(admission))
    }

    async fn process(
        &self,
        raw_url: &str,
        enrich: bool,
        stage: &StageCell,
    ) -> Result<FeedReport, Failure> {
        let inner = &self.inner;
        let url = FeedUrl::parse(raw_url, inner.config.host_policy())
            .map_err(|e| Failure::new(Stage::Validate, e))?;
        let mut warnings = Vec::new();

        stage.set(Stage::CacheCheck);
        let key = CacheKey::new(url.clone(), enrich);
        match inner.cache.get(&key).await {
            Ok(Some(feed)) => {
                tracing::debug!(key = %key, "Cache hit");
                return Ok(FeedReport {
                    feed,
                    from_cache: true,
                    warnings,
                });
            }
            Ok(None) => tracing::debug!(key = %key, "Cache miss"),
            Err(e) => return Err(Failure::new(Stage::CacheCheck, e)),
        }

        // An enriched miss can still be served from the unenriched slot
        let raw_key = CacheKey::new(url.clone(), false);
        let cached_raw = if enrich {
            match inner.cache.get(&raw_key).await {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(key = %raw_key, error = %e, "Cache read failed, fetching instead");
                    warnings.push(Warning::cache_read(e));
                    None
                }
            }
        } else {
            None
        };
        let raw_from_cache = cached_raw.is_some();

        let parsed = match cached_raw {
            Some(feed) => {
                tracing::debug!(key = %raw_key, "Enriching from cached unenriched feed");
                feed
            }
            None => {
                stage.set(Stage::Fetching);
                let doc = inner
                    .fetcher
                    .fetch(&url)
                    .await
                    .map_err(|e| Failure::new(Stage::Fetching, e))?;

                stage.set(Stage::Parsing);
                let feed = feed::parse(&doc).map_err(|e| Failure::new(Stage::Parsing, e))?;
                tracing::debug!(
                    url = %url,
                    items = feed.items.len(),
                    dropped = feed.dropped_items,
                    "Parsed feed"
                );
                feed
            }
        };
        inner.local_index.register(&parsed);

        let enriched = if enrich {
            stage.set(Stage::Enriching);
            let out = inner
                .pipeline
                .enrich(&parsed)
                .await
                .map_err(|e| Failure::new(Stage::Enriching, e))?;
            warnings.extend(out.failures.into_iter().map(Warning::from));
            Some(out.feed)
        } else {
            None
        };

        // CacheWrite: failures are reported, never fatal
        let ttl = inner.config.default_ttl();
        let mut writes: Vec<(&CacheKey, &Feed)> = Vec::with_capacity(2);
        if !raw_from_cache {
            writes.push((&raw_key, &parsed));
        }
        if let Some(feed) = &enriched {
            writes.push((&key, feed));
        }
        for (write_key, feed) in writes {
            if let Err(e) = self.cache_write(write_key, feed, ttl).await {
                tracing::warn!(key = %write_key, error = %e, "Cache write failed");
                warnings.push(Warning::cache_write(e));
            }
        }

        Ok(FeedReport {
            feed: enriched.unwrap_or(parsed),
            from_cache: false,
            warnings,
        })
    }

    async fn cache_write(&self, key: &CacheKey, feed: &Feed, ttl: Duration) -> Result<(), CacheError> {
        if !self.inner.admission.borrow().open {
            return Err(CacheError::Closed);
        }
        self.inner.cache.put(key, feed, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<rss version="2.0"><channel><title>T</title>
        <item><guid>1</guid><title>One</title><link>https://example.com/1</link></item>
        </channel></rss>"#;

    fn test_config() -> EngineConfig {
        EngineConfig {
            allow_private_hosts: true,
            max_retries: 0,
            retry_backoff_ms: 1,
            shutdown_grace_ms: 100,
            cache_sweep_interval_secs: 0,
            ..EngineConfig::default()
        }
    }

    /// A store whose writes always fail, for the warning path.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl CacheStore for ReadOnlyStore {
        fn backend(&self) -> crate::config::CacheBackend {
            self.0.backend()
        }
        async fn get(&self, key: &CacheKey) -> Result<Option<Feed>, CacheError> {
            self.0.get(key).await
        }
        async fn put(&self, _: &CacheKey, _: &Feed, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Io(std::io::Error::other("disk full")))
        }
        async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
            self.0.invalidate(key).await
        }
        async fn purge_expired(&self) -> Result<u64, CacheError> {
            self.0.purge_expired().await
        }
        async fn stats(&self) -> Result<CacheStats, CacheError> {
            self.0.stats().await
        }
        async fn close(&self) {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_invalid_url_fails_in_validate() {
        let engine = Engine::new(EngineConfig::default()).await.unwrap();
        let failure = engine
            .parse_feed_detailed("ftp://example.com/feed", false)
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Validate);
        assert_eq!(failure.error.kind(), ErrorKind::InvalidUrl);

        let failure = engine
            .parse_feed_detailed("http://127.0.0.1/feed", false)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::InvalidUrl);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrent_fetches: 0,
            ..EngineConfig::default()
        };
        let err = Engine::new(config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_warning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let engine = Engine::builder(test_config())
            .cache(Arc::new(ReadOnlyStore(MemoryStore::new(4))))
            .build()
            .await
            .unwrap();
        let report = engine
            .parse_feed(&format!("{}/feed", server.uri()), false)
            .await
            .unwrap();

        assert_eq!(report.feed.items.len(), 1);
        assert!(!report.from_cache);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::CacheWrite);
        assert!(report.warnings[0].message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_fetch_failure_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let engine = Engine::new(test_config()).await.unwrap();
        let failure = engine
            .parse_feed_detailed(&format!("{}/feed", server.uri()), true)
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Fetching);
        assert_eq!(failure.error.kind(), ErrorKind::HttpStatus);
        assert_eq!(engine.cache_stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_parse_failure_reports_parsing_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let engine = Engine::new(test_config()).await.unwrap();
        let failure = engine
            .parse_feed_detailed(&format!("{}/feed", server.uri()), false)
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Parsing);
        assert_eq!(failure.error.kind(), ErrorKind::MalformedFeed);
    }

    #[tokio::test]
    async fn test_enriched_request_fills_both_slots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(1)
            .mount(&server)
            .await;

        let engine = Engine::new(test_config()).await.unwrap();
        let url = format!("{}/feed", server.uri());
        let enriched = engine.parse_feed(&url, true).await.unwrap();
        assert!(enriched.feed.items[0].enrichment.is_some());

        let raw = engine.parse_feed(&url, false).await.unwrap();
        assert!(raw.from_cache);
        assert!(raw.feed.items[0].enrichment.is_none());
        assert_eq!(engine.cache_stats().await.unwrap().entries, 2);

        assert!(engine.invalidate(&url).await.unwrap());
        assert_eq!(engine.cache_stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_refuses_work() {
        let engine = Engine::new(test_config()).await.unwrap();
        let first = engine.close().await;
        assert_eq!(first, ShutdownSummary { in_flight: 0, drained: true });
        assert_eq!(engine.close().await, first);
        assert!(engine.is_closed());

        let err = engine
            .parse_feed("https://example.com/feed", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert!(matches!(
            engine.search("rust").await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_close_aborts_requests_past_grace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let engine = Engine::new(test_config()).await.unwrap();
        let url = format!("{}/slow", server.uri());
        let request = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.parse_feed_detailed(&url, false).await })
        };
        // Let the request get admitted and onto the wire
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = engine.close().await;
        assert_eq!(summary, ShutdownSummary { in_flight: 1, drained: false });

        let failure = request.await.unwrap().unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Aborted);
        assert_eq!(failure.stage, Stage::Fetching);
    }

    #[tokio::test]
    async fn test_close_waits_for_fast_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let config = EngineConfig {
            shutdown_grace_ms: 2000,
            ..test_config()
        };
        let engine = Engine::new(config).await.unwrap();
        let url = format!("{}/feed", server.uri());
        let request = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.parse_feed(&url, false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = engine.close().await;
        assert!(summary.drained);
        let report = request.await.unwrap().unwrap();
        assert_eq!(report.feed.items.len(), 1);
        // Finished after shutdown began, so its result was not cached
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::CacheWrite));
    }
}
