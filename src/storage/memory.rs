use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::types::{now_millis, CacheEntry, CacheError, CacheKey, CacheStats};
use super::CacheStore;
use crate::config::CacheBackend;
use crate::feed::Feed;

/// Bounded in-process LRU. Every operation runs under one lock, so a `put`
/// replaces an entry whole and concurrent writers to a key serialize.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<String, CacheEntry>>, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        // A panic mid-operation cannot leave a half-written entry behind, so
        // the map is still consistent after poisoning.
        Ok(self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> CacheBackend {
        CacheBackend::Memory
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Feed>, CacheError> {
        let storage_key = key.storage_key();
        let mut entries = self.lock()?;

        let fresh = match entries.get(&storage_key) {
            None => return Ok(None),
            Some(entry) => (!entry.is_stale(now_millis())).then(|| entry.feed.clone()),
        };
        if fresh.is_none() {
            entries.pop(&storage_key);
        }
        Ok(fresh)
    }

    async fn put(&self, key: &CacheKey, feed: &Feed, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(feed.clone(), ttl);
        self.lock()?.put(key.storage_key(), entry);
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.lock()?.pop(&key.storage_key()).is_some())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = now_millis();
        let mut entries = self.lock()?;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_stale(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        Ok(stale.len() as u64)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = now_millis();
        let entries = self.lock()?;
        Ok(CacheStats {
            backend: CacheBackend::Memory,
            entries: entries.len() as u64,
            expired: entries.iter().filter(|(_, e)| e.is_stale(now)).count() as u64,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{feed_with_title, key};

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new(8);
        let k = key("https://example.com/feed", false);
        store
            .put(&k, &feed_with_title("One"), Duration::from_secs(60))
            .await
            .unwrap();

        let got = store.get(&k).await.unwrap().unwrap();
        assert_eq!(got.title, "One");
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let store = MemoryStore::new(8);
        let raw = key("https://example.com/feed", false);
        let enriched = key("https://example.com/feed", true);
        store
            .put(&raw, &feed_with_title("raw"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.get(&enriched).await.unwrap().is_none());
        assert!(store.get(&raw).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_miss() {
        let store = MemoryStore::new(8);
        let k = key("https://example.com/feed", false);
        store
            .put(&k, &feed_with_title("gone"), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.get(&k).await.unwrap().is_none());
        // Stale read also evicts
        assert_eq!(store.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let store = MemoryStore::new(2);
        let ttl = Duration::from_secs(60);
        let (a, b, c) = (
            key("https://a.example/", false),
            key("https://b.example/", false),
            key("https://c.example/", false),
        );
        store.put(&a, &feed_with_title("a"), ttl).await.unwrap();
        store.put(&b, &feed_with_title("b"), ttl).await.unwrap();
        store.get(&a).await.unwrap();
        store.put(&c, &feed_with_title("c"), ttl).await.unwrap();

        assert!(store.get(&a).await.unwrap().is_some());
        assert!(store.get(&b).await.unwrap().is_none());
        assert!(store.get(&c).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_and_invalidate() {
        let store = MemoryStore::new(8);
        let live = key("https://live.example/", false);
        let dead = key("https://dead.example/", false);
        store
            .put(&live, &feed_with_title("live"), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put(&dead, &feed_with_title("dead"), Duration::ZERO)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.entries, stats.expired), (2, 1));
        assert_eq!(store.purge_expired().await.unwrap(), 1);

        assert!(store.invalidate(&live).await.unwrap());
        assert!(!store.invalidate(&live).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_store_rejects() {
        let store = MemoryStore::new(8);
        store.close().await;
        store.close().await;
        let k = key("https://example.com/", false);
        assert!(matches!(store.get(&k).await, Err(CacheError::Closed)));
    }
}
