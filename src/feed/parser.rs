//! RSS/Atom decoding into the normalized [`Feed`] model.
//!
//! Three passes:
//!
//! 1. A structural sniff with `quick-xml` reads the declared encoding and the
//!    root element. The root decides RSS vs Atom; `Content-Type` is ignored.
//! 2. Bytes in a supported legacy encoding are transcoded to UTF-8.
//! 3. `feed-rs` builds the document model, and each entry is mapped to an
//!    [`Item`] on its own. Entries that cannot become an item are dropped and
//!    counted instead of failing the feed.

use feed_rs::model;
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use thiserror::Error;

use super::types::{Enclosure, Feed, FeedFormat, Item, RawDocument};
use crate::error::ErrorKind;
use crate::util::strip_control_chars;

#[derive(Debug, Error)]
pub enum ParseError {
    /// Neither valid RSS nor valid Atom
    #[error("Malformed feed: {0}")]
    Malformed(String),
    /// Declared (or detected) character encoding cannot be decoded
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::MalformedFeed,
            Self::UnsupportedEncoding(_) => ErrorKind::UnsupportedEncoding,
        }
    }
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Parses a fetched document.
///
/// Item order is the document's order. Missing optional values become `""`
/// or `None`.
///
/// # Errors
///
/// - [`ParseError::Malformed`] - not XML, or a root other than `rss`/`RDF`/`feed`
/// - [`ParseError::UnsupportedEncoding`] - UTF-16, an unknown charset, or invalid UTF-8
pub fn parse(doc: &RawDocument) -> Result<Feed, ParseError> {
    let bytes = doc.bytes.strip_prefix(UTF8_BOM).unwrap_or(&doc.bytes);
    if bytes.starts_with(&[0xFE, 0xFF]) || bytes.starts_with(&[0xFF, 0xFE]) {
        return Err(ParseError::UnsupportedEncoding("utf-16".into()));
    }

    let (format, utf8) = if looks_like_json(bytes) {
        (FeedFormat::Json, decode_utf8(bytes)?)
    } else {
        let sniffed = sniff(bytes)?;
        let format = match sniffed.root.as_str() {
            "rss" | "rdf" => FeedFormat::Rss,
            "feed" => FeedFormat::Atom,
            other => {
                return Err(ParseError::Malformed(format!(
                    "root element <{other}> is neither RSS nor Atom"
                )))
            }
        };
        (format, decode(bytes, sniffed.encoding.as_deref())?)
    };

    // Blank ids for guid-less entries, so map_entry can derive its own
    let parsed = feed_rs::parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(utf8.as_bytes())
        .map_err(|e| ParseError::Malformed(e.to_string()))?;

    Ok(build_feed(doc, format, parsed))
}

fn build_feed(doc: &RawDocument, format: FeedFormat, parsed: model::Feed) -> Feed {
    let source = doc.url.as_str();
    let site_link = parsed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self") && l.href != source)
        .map(|l| clean(&l.href))
        .unwrap_or_default();

    let mut items = Vec::with_capacity(parsed.entries.len());
    let mut dropped_items = 0;
    for (position, entry) in parsed.entries.into_iter().enumerate() {
        match map_entry(entry) {
            Ok(item) => items.push(item),
            Err(reason) => {
                dropped_items += 1;
                tracing::warn!(url = %doc.url, position, reason, "Dropping malformed item");
            }
        }
    }

    Feed {
        source_url: doc.url.clone(),
        title: text(parsed.title),
        description: text(parsed.description),
        site_link,
        language: parsed.language.unwrap_or_default(),
        format,
        image: parsed.logo.or(parsed.icon).map(|i| i.uri),
        updated_at: parsed.updated,
        fetched_at: doc.fetched_at,
        items,
        dropped_items,
    }
}

/// Maps one entry, or says why it cannot be kept.
fn map_entry(entry: model::Entry) -> Result<Item, &'static str> {
    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.trim().to_owned());
    let title = text(entry.title);

    if link.is_none() && title.is_empty() {
        return Err("item has neither a link nor a title");
    }
    if let Some(link) = &link {
        if !is_http_url(link) {
            return Err("item link is not an absolute http(s) URL");
        }
    }

    let published_at = entry.published.or(entry.updated);
    let existing_id = Some(entry.id.as_str()).filter(|id| !id.trim().is_empty());
    let id = generate_guid(
        existing_id,
        link.as_deref(),
        &title,
        published_at.map(|dt| dt.timestamp()),
    );

    let enclosures = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|c| {
            c.url.as_ref().map(|url| Enclosure {
                url: url.to_string(),
                mime_type: c
                    .content_type
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_default(),
                length: c.size,
            })
        })
        .collect();
    let thumbnail = entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .next();

    Ok(Item {
        id,
        title,
        link: link.unwrap_or_default(),
        published_at,
        content: entry
            .content
            .and_then(|c| c.body)
            .map(|b| clean(&b))
            .unwrap_or_default(),
        description: text(entry.summary),
        author: entry
            .authors
            .first()
            .map(|p| clean(&p.name))
            .unwrap_or_default(),
        categories: entry.categories.iter().map(|c| clean(&c.term)).collect(),
        enclosures,
        thumbnail,
        enrichment: None,
    })
}

/// Feed text is attacker-controlled; strip control chars before it leaves the parser.
fn clean(s: &str) -> String {
    strip_control_chars(s.trim()).into_owned()
}

fn text(t: Option<model::Text>) -> String {
    t.map(|t| clean(&t.content)).unwrap_or_default()
}

fn is_http_url(s: &str) -> bool {
    url::Url::parse(s).is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
}

/// Keeps a non-blank guid; otherwise hashes link, title and publication time.
fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

// ============================================================================
// Structure and encoding detection
// ============================================================================

struct Sniffed {
    encoding: Option<String>,
    root: String,
}

fn looks_like_json(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'{')
}

/// Reads up to the first element: the XML declaration's encoding and the root's
/// local name, lowercased. Text content is never decoded here, so this is safe
/// to run over bytes in any ASCII-compatible charset.
fn sniff(bytes: &[u8]) -> Result<Sniffed, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut encoding = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Decl(decl)) => {
                encoding = decl
                    .encoding()
                    .and_then(|r| r.ok())
                    .map(|e| String::from_utf8_lossy(&e).trim().to_ascii_lowercase());
            }
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let root = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                return Ok(Sniffed { encoding, root });
            }
            Ok(Event::Eof) => {
                return Err(ParseError::Malformed("document has no root element".into()))
            }
            Ok(_) => {}
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
        }
        buf.clear();
    }
}

/// Produces UTF-8 text, rewriting the XML declaration when the source was
/// transcoded so downstream parsers do not decode a second time.
fn decode<'a>(bytes: &'a [u8], declared: Option<&str>) -> Result<Cow<'a, str>, ParseError> {
    match declared {
        None | Some("utf-8" | "utf8" | "us-ascii" | "ascii") => decode_utf8(bytes),
        Some("iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" | "l1") => {
            let text: String = bytes.iter().map(|&b| char::from(b)).collect();
            Ok(Cow::Owned(rewrite_declaration(&text)))
        }
        Some("windows-1252" | "cp1252" | "x-cp1252") => {
            let text: String = bytes.iter().map(|&b| windows_1252_char(b)).collect();
            Ok(Cow::Owned(rewrite_declaration(&text)))
        }
        Some(other) => Err(ParseError::UnsupportedEncoding(other.to_owned())),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<Cow<'_, str>, ParseError> {
    std::str::from_utf8(bytes)
        .map(Cow::Borrowed)
        .map_err(|e| ParseError::UnsupportedEncoding(format!("invalid UTF-8: {e}")))
}

fn rewrite_declaration(text: &str) -> String {
    const UTF8_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
    let trimmed = text.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return format!("{UTF8_DECL}{}", &trimmed[end + 2..]);
        }
    }
    text.to_owned()
}

/// 0x80..=0x9F differ from Latin-1; everything else maps to the same code point.
fn windows_1252_char(b: u8) -> char {
    const HIGH: [char; 32] = [
        '\u{20AC}', '\u{81}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}',
        '\u{2021}', '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{8D}',
        '\u{017D}', '\u{8F}', '\u{90}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}',
        '\u{2022}', '\u{2013}', '\u{2014}', '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}',
        '\u{0153}', '\u{9D}', '\u{017E}', '\u{0178}',
    ];
    match b {
        0x80..=0x9F => HIGH[usize::from(b - 0x80)],
        _ => char::from(b),
    }
}
