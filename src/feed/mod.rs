//! Feed retrieval and normalization.
//!
//! - [`fetcher`] - HTTP retrieval with deadline, retry and a shared concurrency cap
//! - [`parser`] - RSS/Atom detection, charset decoding and mapping into [`Feed`]
//! - [`types`] - the normalized model handed to enrichment, cache and callers
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use digests::feed::{parse, FeedUrl, Fetcher};
//! use digests::util::HostPolicy;
//! use digests::EngineConfig;
//!
//! let fetcher = Fetcher::from_config(&EngineConfig::default())?;
//! let url = FeedUrl::parse("https://example.com/feed.xml", HostPolicy::PublicOnly)?;
//! let feed = parse(&fetcher.fetch(&url).await?)?;
//! println!("{}: {} items", feed.title, feed.items.len());
//! # Ok(())
//! # }
//! ```

pub mod fetcher;
pub mod parser;
mod types;

pub use fetcher::{FetchError, FetchPolicy, Fetcher};
pub use parser::{parse, ParseError};
pub use types::{
    Enclosure, EnrichmentData, Feed, FeedFormat, FeedUrl, Item, PageMetadata, RawDocument,
};
