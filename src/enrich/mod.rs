//! Post-parse enrichment.
//!
//! An [`EnrichmentPipeline`] runs an ordered list of [`EnrichmentStep`]s over
//! every item of a feed. The input feed is never touched; the result is a new
//! feed whose items carry [`EnrichmentData`]. When any step fails for an item,
//! that item is returned unenriched and a warning is recorded, and the other
//! items are unaffected.

mod metadata;
mod steps;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;

pub use metadata::PageMetadataStep;
pub use steps::{
    CanonicalLinkStep, DedupKeyStep, ReadingTimeStep, SummaryStep, TagsStep, ThumbnailStep,
};

use crate::config::EngineConfig;
use crate::feed::{EnrichmentData, Feed, Fetcher, Item};

/// Items enriched at once; matters only when a step touches the network.
const ITEM_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum EnrichError {
    /// The feed as a whole cannot be enriched
    #[error("Feed cannot be enriched: {0}")]
    UnusableFeed(String),
}

/// One unit of derived data. Steps run in order and see what earlier steps wrote.
#[async_trait]
pub trait EnrichmentStep: Send + Sync {
    /// Short identifier used in warnings and logs.
    fn name(&self) -> &'static str;

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()>;
}

/// A step failure for one item. The item is still in the feed, unenriched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item_id: String,
    pub step: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Enriched {
    pub feed: Feed,
    pub failures: Vec<ItemFailure>,
}

#[derive(Clone)]
pub struct EnrichmentPipeline {
    steps: Arc<[Arc<dyn EnrichmentStep>]>,
}

impl std::fmt::Debug for EnrichmentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl EnrichmentPipeline {
    /// Built-in steps; page metadata is added when `fetch_page_metadata` is set.
    pub fn standard(config: &EngineConfig, fetcher: &Fetcher) -> Self {
        let mut steps: Vec<Arc<dyn EnrichmentStep>> = vec![
            Arc::new(SummaryStep {
                width: config.summary_width,
            }),
            Arc::new(CanonicalLinkStep),
            Arc::new(DedupKeyStep),
            Arc::new(TagsStep),
            Arc::new(ReadingTimeStep),
            Arc::new(ThumbnailStep),
        ];
        if config.fetch_page_metadata {
            steps.push(Arc::new(PageMetadataStep::new(
                fetcher.clone(),
                config.host_policy(),
            )));
        }
        Self::with_steps(steps)
    }

    pub fn with_steps(steps: Vec<Arc<dyn EnrichmentStep>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Returns an enriched copy of `feed`.
    ///
    /// Enrichment always starts from the unenriched item, so running the
    /// pipeline over an already-enriched feed recomputes rather than merges.
    ///
    /// # Errors
    ///
    /// [`EnrichError::UnusableFeed`] when the feed's source URL is not a URL
    /// (e.g. a tampered cache entry). Item-level failures are never errors.
    pub async fn enrich(&self, feed: &Feed) -> Result<Enriched, EnrichError> {
        if url::Url::parse(feed.source_url.as_str()).is_err() {
            return Err(EnrichError::UnusableFeed(format!(
                "source URL {:?} is not a valid URL",
                feed.source_url.as_str()
            )));
        }

        let outcomes: Vec<(Item, Option<ItemFailure>)> = stream::iter(feed.items.iter())
            .map(|item| self.enrich_item(item))
            .buffered(ITEM_CONCURRENCY)
            .boxed()
            .collect()
            .await;

        let mut items = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (item, failure) in outcomes {
            items.push(item);
            failures.extend(failure);
        }
        if !failures.is_empty() {
            tracing::warn!(
                url = %feed.source_url,
                degraded = failures.len(),
                total = items.len(),
                "Some items could not be enriched"
            );
        }

        Ok(Enriched {
            feed: Feed {
                items,
                ..feed.clone_metadata()
            },
            failures,
        })
    }

    async fn enrich_item(&self, item: &Item) -> (Item, Option<ItemFailure>) {
        let mut base = item.clone();
        base.enrichment = None;

        let mut data = EnrichmentData::default();
        for step in self.steps.iter() {
            if let Err(e) = step.apply(&base, &mut data).await {
                tracing::debug!(item = %base.id, step = step.name(), error = %e, "Enrichment step failed");
                let failure = ItemFailure {
                    item_id: base.id.clone(),
                    step: step.name(),
                    message: format!("{e:#}"),
                };
                return (base, Some(failure));
            }
        }

        base.enrichment = Some(data);
        (base, None)
    }
}

impl Feed {
    /// Copy of everything but the items.
    fn clone_metadata(&self) -> Feed {
        Feed {
            source_url: self.source_url.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            site_link: self.site_link.clone(),
            language: self.language.clone(),
            format: self.format,
            image: self.image.clone(),
            updated_at: self.updated_at,
            fetched_at: self.fetched_at,
            items: Vec::new(),
            dropped_items: self.dropped_items,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::feed::Item;

    pub fn item(id: &str, link: &str) -> Item {
        Item {
            id: id.to_string(),
            title: format!("Item {id}"),
            link: link.to_string(),
            published_at: None,
            content: String::new(),
            description: String::new(),
            author: String::new(),
            categories: vec![],
            enclosures: vec![],
            thumbnail: None,
            enrichment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::feed_with_title;
    use pretty_assertions::assert_eq;

    struct FailOn(&'static str);

    #[async_trait]
    impl EnrichmentStep for FailOn {
        fn name(&self) -> &'static str {
            "fail_on"
        }

        async fn apply(&self, item: &Item, _data: &mut EnrichmentData) -> anyhow::Result<()> {
            if item.id == self.0 {
                anyhow::bail!("upstream unreachable");
            }
            Ok(())
        }
    }

    fn three_items() -> Feed {
        let mut feed = feed_with_title("three");
        feed.items = ["a", "b", "c"]
            .iter()
            .map(|id| test_support::item(id, &format!("https://example.com/{id}")))
            .collect();
        feed
    }

    fn pipeline() -> EnrichmentPipeline {
        let config = EngineConfig::default();
        let fetcher = Fetcher::from_config(&config).unwrap();
        EnrichmentPipeline::standard(&config, &fetcher)
    }

    #[test]
    fn test_standard_steps() {
        assert_eq!(
            pipeline().step_names(),
            vec!["summary", "canonical_link", "dedup_key", "tags", "reading_time", "thumbnail"]
        );

        let config = EngineConfig {
            fetch_page_metadata: true,
            ..EngineConfig::default()
        };
        let fetcher = Fetcher::from_config(&config).unwrap();
        let names = EnrichmentPipeline::standard(&config, &fetcher).step_names();
        assert_eq!(names.last(), Some(&"page_metadata"));
    }

    #[tokio::test]
    async fn test_enrich_is_pure_and_preserves_order() {
        let input = three_items();
        let before = input.clone();
        let out = pipeline().enrich(&input).await.unwrap();

        assert_eq!(input, before);
        assert!(out.failures.is_empty());
        let ids: Vec<_> = out.feed.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(out.feed.items.iter().all(|i| i.enrichment.is_some()));
        assert_eq!(out.feed.without_enrichment(), input);
    }

    #[tokio::test]
    async fn test_failing_item_degrades_only_that_item() {
        let mut steps: Vec<Arc<dyn EnrichmentStep>> = vec![Arc::new(TagsStep)];
        steps.push(Arc::new(FailOn("b")));
        let out = EnrichmentPipeline::with_steps(steps)
            .enrich(&three_items())
            .await
            .unwrap();

        assert_eq!(out.feed.items.len(), 3);
        assert!(out.feed.items[0].enrichment.is_some());
        assert!(out.feed.items[1].enrichment.is_none());
        assert!(out.feed.items[2].enrichment.is_some());
        assert_eq!(
            out.failures,
            vec![ItemFailure {
                item_id: "b".into(),
                step: "fail_on",
                message: "upstream unreachable".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_enriching_twice_recomputes() {
        let p = pipeline();
        let once = p.enrich(&three_items()).await.unwrap().feed;
        let twice = p.enrich(&once).await.unwrap().feed;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_unusable_feed_rejected() {
        let mut feed = three_items();
        feed.source_url = serde_json::from_str("\"not a url\"").unwrap();
        assert!(matches!(
            pipeline().enrich(&feed).await,
            Err(EnrichError::UnusableFeed(_))
        ));
    }
}
