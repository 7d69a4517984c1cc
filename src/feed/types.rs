use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::{validate_url, HostPolicy, UrlValidationError};

/// A validated, normalized absolute http(s) feed URL. The primary cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedUrl(String);

impl FeedUrl {
    /// Validates `raw` under `policy` and stores its normalized form
    /// (`https://Example.com` becomes `https://example.com/`).
    pub fn parse(raw: &str, policy: HostPolicy) -> Result<Self, UrlValidationError> {
        validate_url(raw, policy).map(|url| Self(url.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FeedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FeedUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bytes of one successful fetch. Never partial.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub url: FeedUrl,
    pub bytes: Vec<u8>,
    /// `Content-Type` as served. Informational only; format detection ignores it.
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Rss,
    Atom,
    Json,
}

/// A normalized feed. Items keep the order the document declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub source_url: FeedUrl,
    pub title: String,
    pub description: String,
    /// Home page of the site publishing the feed, or `""`.
    pub site_link: String,
    pub language: String,
    pub format: FeedFormat,
    pub image: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<Item>,
    /// Items present in the document but dropped as malformed.
    pub dropped_items: usize,
}

impl Feed {
    /// Returns a copy with every item's enrichment removed.
    pub fn without_enrichment(&self) -> Feed {
        let mut feed = self.clone();
        for item in &mut feed.items {
            item.enrichment = None;
        }
        feed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identity: the feed's guid/id when present, else a hash of
    /// link, title and publication time.
    pub id: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Full body (`content:encoded` / Atom `content`), or `""`.
    pub content: String,
    /// Short description / Atom summary, or `""`.
    pub description: String,
    pub author: String,
    pub categories: Vec<String>,
    pub enclosures: Vec<Enclosure>,
    pub thumbnail: Option<String>,
    /// `None` until the enrichment pipeline has run over the item.
    pub enrichment: Option<EnrichmentData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: String,
    pub length: Option<u64>,
}

/// Fields derived from an item after parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentData {
    pub summary: String,
    pub canonical_link: String,
    pub dedup_key: String,
    pub tags: Vec<String>,
    pub reading_time_minutes: u32,
    pub thumbnail: Option<String>,
    /// Open Graph data of the item's page. Network-dependent, so two runs
    /// over the same document may disagree here and only here.
    pub page_metadata: Option<PageMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub site_name: Option<String>,
}
