use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use super::{SearchError, SearchHit, SearchSource};
use crate::feed::Feed;

/// Feeds this engine has parsed, searchable by title and description.
///
/// Keyed by feed URL and bounded; past `capacity` the least recently
/// registered feed is dropped.
#[derive(Debug)]
pub struct LocalIndex {
    entries: Mutex<LruCache<String, IndexedFeed>>,
}

#[derive(Debug, Clone)]
struct IndexedFeed {
    title: String,
    description: String,
    site_url: String,
    // Lowercased copies for matching
    title_lc: String,
    description_lc: String,
}

impl LocalIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Adds or refreshes a feed.
    pub fn register(&self, feed: &Feed) {
        let entry = IndexedFeed {
            title: feed.title.clone(),
            description: feed.description.clone(),
            site_url: feed.site_link.clone(),
            title_lc: feed.title.to_lowercase(),
            description_lc: feed.description.to_lowercase(),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(feed.source_url.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fraction of query terms found, title matches counting double.
fn score(entry: &IndexedFeed, terms: &[String]) -> f64 {
    let max = (terms.len() * 2) as f64;
    let points: usize = terms
        .iter()
        .map(|t| {
            if entry.title_lc.contains(t.as_str()) {
                2
            } else if entry.description_lc.contains(t.as_str()) {
                1
            } else {
                0
            }
        })
        .sum();
    points as f64 / max
}

#[async_trait]
impl SearchSource for LocalIndex {
    fn name(&self) -> &'static str {
        "local"
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        // Most recently registered first; ranking keeps that order for ties
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .filter_map(|(url, e)| {
                let s = score(e, &terms);
                (s > 0.0).then(|| SearchHit {
                    feed_url: url.clone(),
                    title: e.title.clone(),
                    score: s,
                    description: e.description.clone(),
                    site_url: e.site_url.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedUrl;
    use crate::storage::test_support::feed_with_title;
    use crate::util::HostPolicy;

    fn feed(url: &str, title: &str, description: &str) -> Feed {
        let mut feed = feed_with_title(title);
        feed.source_url = FeedUrl::parse(url, HostPolicy::PublicOnly).unwrap();
        feed.description = description.to_string();
        feed
    }

    #[tokio::test]
    async fn test_title_outscores_description() {
        let index = LocalIndex::new(16);
        index.register(&feed("https://a.example/", "Cooking daily", "recipes"));
        index.register(&feed("https://b.example/", "Rust weekly", "systems news"));
        index.register(&feed("https://c.example/", "Misc", "about rust and more"));

        let hits = index.search("rust").await.unwrap();
        let urls: Vec<_> = hits.iter().map(|h| h.feed_url.as_str()).collect();
        assert_eq!(urls, vec!["https://b.example/", "https://c.example/"]);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);
    }

    #[tokio::test]
    async fn test_no_match_is_empty() {
        let index = LocalIndex::new(16);
        index.register(&feed("https://a.example/", "Cooking", ""));
        assert!(index.search("astronomy").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_refreshes_in_place() {
        let index = LocalIndex::new(16);
        index.register(&feed("https://a.example/", "Old", ""));
        index.register(&feed("https://b.example/", "Other", ""));
        index.register(&feed("https://a.example/", "New title", ""));

        assert_eq!(index.len(), 2);
        let hits = index.search("new").await.unwrap();
        assert_eq!(hits[0].title, "New title");
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_registered() {
        let index = LocalIndex::new(2);
        index.register(&feed("https://a.example/", "Rust one", ""));
        index.register(&feed("https://b.example/", "Rust two", ""));
        // Refreshing a keeps it; b becomes the oldest
        index.register(&feed("https://a.example/", "Rust one", ""));
        index.register(&feed("https://c.example/", "Rust three", ""));

        assert_eq!(index.len(), 2);
        let hits = index.search("rust").await.unwrap();
        let mut urls: Vec<_> = hits.iter().map(|h| h.feed_url.as_str()).collect();
        urls.sort_unstable();
        assert_eq!(urls, vec!["https://a.example/", "https://c.example/"]);
    }

    #[tokio::test]
    async fn test_repeated_registration_does_not_grow() {
        let index = LocalIndex::new(8);
        for _ in 0..50 {
            index.register(&feed("https://a.example/", "Same feed", ""));
        }
        assert_eq!(index.len(), 1);
    }
}
