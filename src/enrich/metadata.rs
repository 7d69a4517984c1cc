use anyhow::Context;
use async_trait::async_trait;
use scraper::{Html, Selector};

use super::EnrichmentStep;
use crate::feed::{EnrichmentData, Fetcher, Item, PageMetadata};
use crate::util::{strip_control_chars, validate_url, HostPolicy};

/// Reads Open Graph tags from the item's web page.
///
/// The only network-dependent step: its output can differ between two runs
/// over the same feed document. A fetch failure degrades the item.
pub struct PageMetadataStep {
    fetcher: Fetcher,
    policy: HostPolicy,
}

impl PageMetadataStep {
    pub fn new(fetcher: Fetcher, policy: HostPolicy) -> Self {
        Self { fetcher, policy }
    }
}

#[async_trait]
impl EnrichmentStep for PageMetadataStep {
    fn name(&self) -> &'static str {
        "page_metadata"
    }

    async fn apply(&self, item: &Item, data: &mut EnrichmentData) -> anyhow::Result<()> {
        if item.link.is_empty() {
            return Ok(());
        }
        let url = validate_url(&item.link, self.policy)
            .with_context(|| format!("refusing to fetch item page {}", item.link))?;
        let (bytes, _) = self
            .fetcher
            .fetch_bytes(url.as_str())
            .await
            .with_context(|| format!("fetching item page {url}"))?;

        let html = String::from_utf8_lossy(&bytes);
        data.page_metadata = Some(extract_open_graph(&html)?);
        Ok(())
    }
}

/// Collects `og:title`, `og:description`, `og:image` and `og:site_name` from
/// `<meta>` tags in the document head. First occurrence wins.
pub(crate) fn extract_open_graph(html: &str) -> anyhow::Result<PageMetadata> {
    let selector = Selector::parse("head meta")
        .map_err(|e| anyhow::anyhow!("invalid meta selector: {e:?}"))?;
    let document = Html::parse_document(html);

    let mut meta = PageMetadata::default();
    for element in document.select(&selector) {
        let tag = element.value();
        let Some(property) = tag.attr("property").or_else(|| tag.attr("name")) else {
            continue;
        };
        let Some(content) = tag.attr("content") else {
            continue;
        };
        let value = strip_control_chars(content).trim().to_owned();
        if value.is_empty() {
            continue;
        }

        let slot = match property.to_ascii_lowercase().as_str() {
            "og:title" => &mut meta.title,
            "og:description" => &mut meta.description,
            "og:image" => &mut meta.image,
            "og:site_name" => &mut meta.site_name,
            _ => continue,
        };
        slot.get_or_insert(value);
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::test_support::item;
    use crate::feed::FetchPolicy;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<html><head>
        <meta property="og:title" content="Tom &amp; Jerry">
        <meta property="og:title" content="second title ignored">
        <meta name="og:description" content='A cartoon'>
        <meta property="og:image" content="https://example.com/tj.png"/>
        <meta property="og:site_name" content="">
        </head><body><meta property="og:site_name" content="Body Site"></body></html>"#;

    fn fetcher() -> Fetcher {
        let policy = FetchPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 0,
            backoff: Duration::from_millis(1),
            max_bytes: 64 * 1024,
        };
        Fetcher::new(reqwest::Client::new(), policy, 2)
    }

    #[test]
    fn test_extract_open_graph() {
        let meta = extract_open_graph(PAGE).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Tom & Jerry"));
        assert_eq!(meta.description.as_deref(), Some("A cartoon"));
        assert_eq!(meta.image.as_deref(), Some("https://example.com/tj.png"));
        // Empty in the head, and body tags are not read
        assert_eq!(meta.site_name, None);
    }

    #[test]
    fn test_extract_open_graph_decodes_attribute_entities() {
        let page = r#"<head><meta property="og:description" content="Caf&eacute; &mdash; open"></head>"#;
        let meta = extract_open_graph(page).unwrap();
        assert_eq!(meta.description.as_deref(), Some("Caf\u{e9} \u{2014} open"));
    }

    #[tokio::test]
    async fn test_step_fetches_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let step = PageMetadataStep::new(fetcher(), HostPolicy::AllowPrivate);
        let mut data = EnrichmentData::default();
        step.apply(&item("1", &format!("{}/post", server.uri())), &mut data)
            .await
            .unwrap();
        assert_eq!(
            data.page_metadata.and_then(|m| m.title).as_deref(),
            Some("Tom & Jerry")
        );
    }

    #[tokio::test]
    async fn test_step_fails_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let step = PageMetadataStep::new(fetcher(), HostPolicy::AllowPrivate);
        let mut data = EnrichmentData::default();
        let result = step
            .apply(&item("1", &format!("{}/gone", server.uri())), &mut data)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_step_refuses_private_hosts_under_strict_policy() {
        let step = PageMetadataStep::new(fetcher(), HostPolicy::PublicOnly);
        let mut data = EnrichmentData::default();
        let result = step
            .apply(&item("1", "http://127.0.0.1:9/post"), &mut data)
            .await;
        assert!(result.is_err());
    }
}
