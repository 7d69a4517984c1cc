//! Embeddable RSS/Atom feed engine.
//!
//! `digests` fetches feeds over HTTP, normalizes RSS and Atom into one model,
//! optionally enriches every item (summaries, canonical links, dedup keys,
//! tags), caches results in memory or in an on-disk SQLite store, and resolves
//! free-text queries or site URLs to feed URLs.
//!
//! Two ways in:
//!
//! - [`Engine`] for callers that want to own an instance and its lifetime.
//! - [`lifecycle`] for a process-wide engine behind `init`/`close`, the shape
//!   a foreign-function boundary expects.
//!
//! ```no_run
//! # async fn demo() -> digests::Result<()> {
//! use digests::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default()).await?;
//! let report = engine.parse_feed("https://example.com/feed.xml", true).await?;
//! println!("{} items", report.feed.items.len());
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod search;
pub mod storage;
pub mod util;

pub use config::{CacheBackend, EngineConfig};
pub use engine::{
    BatchEntry, BatchReport, Engine, EngineBuilder, Failure, FeedReport, ShutdownSummary, Stage,
    Warning, WarningKind,
};
pub use error::{Error, ErrorKind, Result};
pub use feed::{Enclosure, EnrichmentData, Feed, FeedFormat, FeedUrl, Item, PageMetadata};
pub use search::SearchHit;
