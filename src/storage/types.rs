use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CacheBackend;
use crate::feed::{Feed, FeedUrl};

// ============================================================================
// Error Types
// ============================================================================

/// Storage-layer faults. A miss is never an error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// SQLite reported a failure (locked, corrupt file, disk full, ...)
    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error preparing the cache file
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema creation failed
    #[error("Cache migration failed: {0}")]
    Migration(String),

    /// An entry could not be encoded for storage
    #[error("Cache entry could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store was closed
    #[error("Cache store is closed")]
    Closed,
}

// ============================================================================
// Keys and entries
// ============================================================================

/// One cache slot. Enriched and unenriched results for the same URL live in
/// separate slots, so skipping enrichment never serves (or overwrites) the
/// enriched copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: FeedUrl,
    pub enriched: bool,
}

impl CacheKey {
    pub fn new(url: FeedUrl, enriched: bool) -> Self {
        Self { url, enriched }
    }

    /// Flat string form used as the storage primary key.
    pub fn storage_key(&self) -> String {
        let slot = if self.enriched { "enriched" } else { "raw" };
        format!("feed:{slot}:{}", self.url)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A stored feed plus its timestamps (Unix milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub feed: Feed,
    pub stored_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn new(feed: Feed, ttl: std::time::Duration) -> Self {
        let (stored_at, expires_at) = Self::timestamps(ttl);
        Self {
            feed,
            stored_at,
            expires_at,
        }
    }

    /// `(stored_at, expires_at)` for an entry written now.
    pub fn timestamps(ttl: std::time::Duration) -> (i64, i64) {
        let stored_at = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        (stored_at, stored_at.saturating_add(ttl_ms))
    }

    /// An entry is stale from the instant its TTL has elapsed, so a zero TTL
    /// is stale immediately.
    pub fn is_stale(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub backend: CacheBackend,
    /// Entries physically present, stale or not
    pub entries: u64,
    /// Entries present but already stale
    pub expired: u64,
}
