//! The deterministic built-in enrichment steps.

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EnrichmentStep;
use crate::feed::{EnrichmentData, Item};
use crate::util::{collapse_whitespace, html_to_text, strip_control_chars, truncate_to_width, word_count};

/// Words per minute assumed by [`ReadingTimeStep`].
const WORDS_PER_MINUTE: usize = 200;

/// Query parameters that only track the click and never change the page.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid"];

/// Plain-text summary of the description (or the body when there is none),
/// cut to a fixed display width.
pub struct SummaryStep {
    pub width: usize,
}

#[async_trait]
impl EnrichmentStep for SummaryStep {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        let source = if item.description.trim().is_empty() {
            &item.content
        } else {
            &item.description
        };
        let text = collapse_whitespace(&strip_control_chars(&html_to_text(source)));
        data.summary = truncate_to_width(&text, self.width).into_owned();
        Ok(())
    }
}

/// The item link without its fragment and tracking parameters.
pub struct CanonicalLinkStep;

#[async_trait]
impl EnrichmentStep for CanonicalLinkStep {
    fn name(&self) -> &'static str {
        "canonical_link"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        data.canonical_link = canonicalize(&item.link)?;
        Ok(())
    }
}

pub(crate) fn canonicalize(link: &str) -> anyhow::Result<String> {
    if link.is_empty() {
        return Ok(String::new());
    }
    let mut url =
        url::Url::parse(link).with_context(|| format!("item link {link:?} is not a URL"))?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(url.into())
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// SHA-256 of the canonical link, or of the item id for link-less items.
/// Two items with the same key are the same story.
pub struct DedupKeyStep;

#[async_trait]
impl EnrichmentStep for DedupKeyStep {
    fn name(&self) -> &'static str {
        "dedup_key"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        let canonical = if data.canonical_link.is_empty() {
            canonicalize(&item.link)?
        } else {
            data.canonical_link.clone()
        };
        let basis = if canonical.is_empty() {
            format!("id:{}", item.id)
        } else {
            format!("link:{canonical}")
        };
        data.dedup_key = format!("{:x}", Sha256::digest(basis.as_bytes()));
        Ok(())
    }
}

/// Lowercased, whitespace-collapsed categories in first-seen order.
pub struct TagsStep;

#[async_trait]
impl EnrichmentStep for TagsStep {
    fn name(&self) -> &'static str {
        "tags"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        let mut tags: Vec<String> = Vec::with_capacity(item.categories.len());
        for category in &item.categories {
            let tag = collapse_whitespace(category).to_lowercase();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        data.tags = tags;
        Ok(())
    }
}

pub struct ReadingTimeStep;

#[async_trait]
impl EnrichmentStep for ReadingTimeStep {
    fn name(&self) -> &'static str {
        "reading_time"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        let body = if item.content.trim().is_empty() {
            &item.description
        } else {
            &item.content
        };
        let words = word_count(&html_to_text(body));
        data.reading_time_minutes = u32::try_from(words.div_ceil(WORDS_PER_MINUTE)).unwrap_or(u32::MAX);
        Ok(())
    }
}

/// The feed-declared thumbnail, else the first image enclosure.
pub struct ThumbnailStep;

#[async_trait]
impl EnrichmentStep for ThumbnailStep {
    fn name(&self) -> &'static str {
        "thumbnail"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        data.thumbnail = item.thumbnail.clone().or_else(|| {
            item.enclosures
                .iter()
                .find(|e| e.mime_type.starts_with("image/"))
                .map(|e| e.url.clone())
        });
        Ok(())
    }
}
