//! Feed result cache.
//!
//! One [`CacheStore`] interface, two backends picked once at construction:
//!
//! - [`MemoryStore`] - bounded LRU, lost on restart
//! - [`DurableStore`] - SQLite file, survives restart until entries expire
//!
//! A read of a stale entry is a miss whether or not the entry has been
//! physically removed yet; [`CacheStore::purge_expired`] reclaims the space.

mod durable;
mod memory;
mod types;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use durable::DurableStore;
pub use memory::MemoryStore;
pub use types::{CacheEntry, CacheError, CacheKey, CacheStats};

use crate::config::{CacheBackend, ConfigError, EngineConfig};
use crate::feed::Feed;

/// Key-value store of feed results.
///
/// Implementations must make `put` atomic per key: a concurrent `get` sees
/// either the old entry or the new one, and concurrent writers end with
/// exactly one of their values.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn backend(&self) -> CacheBackend;

    /// Returns the live entry for `key`. Missing and stale entries are `Ok(None)`.
    async fn get(&self, key: &CacheKey) -> Result<Option<Feed>, CacheError>;

    /// Stores `feed` under `key`, replacing any previous entry.
    async fn put(&self, key: &CacheKey, feed: &Feed, ttl: Duration) -> Result<(), CacheError>;

    /// Removes `key`. Returns whether an entry was present.
    async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Physically removes stale entries, returning how many were dropped.
    async fn purge_expired(&self) -> Result<u64, CacheError>;

    async fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Releases backend resources. Later calls fail with [`CacheError::Closed`].
    async fn close(&self);
}

/// Builds the backend named by `config`.
///
/// # Errors
///
/// [`crate::Error::Cache`] if the durable file cannot be opened or migrated,
/// [`crate::Error::Config`] if the durable backend has no `cache_path`.
pub async fn open(config: &EngineConfig) -> Result<Arc<dyn CacheStore>, crate::Error> {
    match config.cache_backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryStore::new(config.memory_cache_capacity))),
        CacheBackend::Durable => {
            let path = config.cache_path.as_deref().ok_or_else(|| {
                ConfigError::Invalid("cache_path is required for the durable cache backend".into())
            })?;
            Ok(Arc::new(DurableStore::open(path).await?))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_selects_backend() {
        let memory = open(&EngineConfig::default()).await.unwrap();
        assert_eq!(memory.backend(), CacheBackend::Memory);

        let dir = tempfile::tempdir().unwrap();
        let config =
            EngineConfig::with_cache(CacheBackend::Durable, Some(dir.path().join("c.db")));
        let durable = open(&config).await.unwrap();
        assert_eq!(durable.backend(), CacheBackend::Durable);
        durable.close().await;
    }

    #[test]
    fn test_storage_key_distinguishes_slots() {
        let raw = test_support::key("https://example.com/feed", false);
        let enriched = test_support::key("https://example.com/feed", true);
        assert_eq!(raw.storage_key(), "feed:raw:https://example.com/feed");
        assert_eq!(enriched.storage_key(), "feed:enriched:https://example.com/feed");
    }
}
