//! Feed discovery: turn a site or feed URL into feed URLs.

use url::Url;

use super::{SearchError, SearchHit};
use crate::feed::{self, FeedUrl, Fetcher, RawDocument};
use crate::util::{extract_attr_value, find_tags, has_attr, strip_control_chars, validate_url, HostPolicy};

/// Fetches `url` and reports the feeds it names.
///
/// - A feed document is its own single hit.
/// - An HTML page yields every `<link rel="alternate">` with an RSS or Atom
///   type, in document order, resolved against the page URL.
/// - Anything else yields no hits.
///
/// # Errors
///
/// - [`SearchError::InvalidQuery`] - the URL fails validation (SSRF guard)
/// - [`SearchError::Unavailable`] - the page could not be fetched
pub async fn discover(
    fetcher: &Fetcher,
    url: &str,
    policy: HostPolicy,
) -> Result<Vec<SearchHit>, SearchError> {
    let page_url = FeedUrl::parse(url, policy)
        .map_err(|e| SearchError::InvalidQuery(format!("cannot discover feeds at {url}: {e}")))?;

    let (bytes, content_type) = fetcher
        .fetch_bytes(page_url.as_str())
        .await
        .map_err(|e| SearchError::Unavailable(format!("fetching {page_url}: {e}")))?;

    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    let is_xml = content_type.contains("application/rss+xml")
        || content_type.contains("application/atom+xml")
        || content_type.contains("application/xml")
        || content_type.contains("text/xml");
    let is_html = content_type.contains("text/html") || content_type.contains("application/xhtml");

    let doc = RawDocument {
        url: page_url.clone(),
        bytes,
        content_type: Some(content_type.clone()),
        fetched_at: chrono::Utc::now(),
    };

    // Ambiguous or missing Content-Type: try feed first, fallback to HTML scan
    if !is_html {
        match feed::parse(&doc) {
            Ok(parsed) => {
                tracing::debug!(url = %page_url, "Discovery target is itself a feed");
                return Ok(vec![SearchHit {
                    feed_url: page_url.to_string(),
                    title: parsed.title,
                    score: 1.0,
                    description: parsed.description,
                    site_url: parsed.site_link,
                }]);
            }
            Err(e) if is_xml => {
                tracing::debug!(url = %page_url, error = %e, "XML discovery target is not a feed");
                return Ok(Vec::new());
            }
            Err(_) => {}
        }
    }

    let html = String::from_utf8_lossy(&doc.bytes);
    let hits: Vec<SearchHit> = find_feed_links_in_html(&html, page_url.as_str())
        .into_iter()
        .filter(|link| validate_url(&link.href, policy).is_ok())
        .map(|link| SearchHit {
            feed_url: link.href,
            title: link.title,
            score: 1.0,
            description: String::new(),
            site_url: page_url.to_string(),
        })
        .collect();
    tracing::debug!(url = %page_url, found = hits.len(), "Scanned page for feed links");
    Ok(hits)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FeedLink {
    pub href: String,
    pub title: String,
}

/// Scans HTML for `<link rel="alternate">` tags with an RSS/Atom `type`.
///
/// Uses simple string scanning (no HTML parser dependency). Handles attribute
/// ordering variations and resolves relative URLs against the base URL.
/// Duplicates are dropped, keeping the first occurrence.
pub(crate) fn find_feed_links_in_html(html: &str, base_url: &str) -> Vec<FeedLink> {
    let mut links: Vec<FeedLink> = Vec::new();

    for tag in find_tags(html, "link") {
        if !has_attr(tag, "rel", "alternate") || !is_feed_type(tag) {
            continue;
        }
        let Some(href) = extract_attr_value(tag, "href") else {
            continue;
        };
        let Some(resolved) = resolve_url(href.trim(), base_url) else {
            continue;
        };
        if links.iter().any(|l| l.href == resolved) {
            continue;
        }
        let title = extract_attr_value(tag, "title")
            .map(|t| strip_control_chars(t.trim()).into_owned())
            .unwrap_or_default();
        links.push(FeedLink {
            href: resolved,
            title,
        });
    }

    links
}

fn is_feed_type(tag: &str) -> bool {
    has_attr(tag, "type", "application/rss+xml") || has_attr(tag, "type", "application/atom+xml")
}

/// Resolves a potentially relative URL against a base URL.
///
/// Protocol-relative hrefs go through the URL parser too, so credentials and
/// `..` segments come out normalized.
fn resolve_url(href: &str, base_url: &str) -> Option<String> {
    if href.starts_with("//") {
        return Url::parse(&format!("https:{href}")).ok().map(Into::into);
    }
    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(Into::into)
}
