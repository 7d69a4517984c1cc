use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::{now_millis, CacheEntry, CacheError, CacheKey, CacheStats};
use super::CacheStore;
use crate::config::CacheBackend;
use crate::feed::Feed;

/// SQLite-backed cache. Entries survive process restart until they expire.
///
/// Each `put` is a single `INSERT OR REPLACE`, so a row is always one
/// complete payload and concurrent writers to a key end with the last
/// committed one.
#[derive(Clone)]
pub struct DurableStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl DurableStore {
    /// Open (or create) the cache file and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the file cannot be opened and
    /// [`CacheError::Migration`] if the schema cannot be created.
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        // Set file permissions BEFORE pool creation so the file never exists
        // with default umask permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to set cache file permissions");
                }
            } else {
                use std::os::unix::fs::OpenOptionsExt;
                // If creation fails, SQLite will report the error at connect_with
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)
                    .ok();
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for a competing writer
        // before returning SQLITE_BUSY
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store
            .migrate()
            .await
            .map_err(|e| CacheError::Migration(e.to_string()))?;
        tracing::info!(path = %path.display(), "Opened durable feed cache");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema creation runs in one transaction; `IF NOT EXISTS` makes
    /// re-running on an existing file a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cache (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feed_cache_expires ON feed_cache(expires_at)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.pool.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for DurableStore {
    fn backend(&self) -> CacheBackend {
        CacheBackend::Durable
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Feed>, CacheError> {
        self.ensure_open()?;
        let storage_key = key.storage_key();

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT payload, expires_at FROM feed_cache WHERE key = ?")
                .bind(&storage_key)
                .fetch_optional(&self.pool)
                .await?;

        let Some((payload, expires_at)) = row else {
            return Ok(None);
        };
        if now_millis() >= expires_at {
            return Ok(None);
        }

        match serde_json::from_str::<Feed>(&payload) {
            Ok(feed) => Ok(Some(feed)),
            Err(e) => {
                // Unreadable rows (older format, manual edits) behave as a miss
                tracing::warn!(key = %storage_key, error = %e, "Discarding corrupt cache entry");
                sqlx::query("DELETE FROM feed_cache WHERE key = ?")
                    .bind(&storage_key)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &CacheKey, feed: &Feed, ttl: Duration) -> Result<(), CacheError> {
        self.ensure_open()?;
        let payload = serde_json::to_string(feed)?;
        let (stored_at, expires_at) = CacheEntry::timestamps(ttl);

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO feed_cache (key, payload, stored_at, expires_at)
            VALUES (?, ?, ?, ?)
        "#,
        )
        .bind(key.storage_key())
        .bind(payload)
        .bind(stored_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM feed_cache WHERE key = ?")
            .bind(key.storage_key())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM feed_cache WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.ensure_open()?;
        let (entries, expired): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END), 0) FROM feed_cache",
        )
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            backend: CacheBackend::Durable,
            entries: entries.max(0) as u64,
            expired: expired.max(0) as u64,
        })
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            tracing::debug!(path = %self.path.display(), "Closed durable feed cache");
        }
    }
}
