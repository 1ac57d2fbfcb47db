//! Durable cache stored in the indexer's SQLite database.
//!
//! Survives restarts, which is what makes it usable as the last-resort answer
//! when every provider for an environment is down.

use super::{CacheError, CachePort};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct SqliteCache {
    pool: Pool<Sqlite>,
}

impl SqliteCache {
    /// The `read_cache` table is part of the schema created by `db::connection`.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Removes entries whose TTL has passed.
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = Utc::now().timestamp();
        let result = sqlx::query("DELETE FROM read_cache WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl CachePort for SqliteCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, CacheError>> {
        async move {
            let now = Utc::now().timestamp();
            let row = sqlx::query(
                "SELECT value FROM read_cache
                 WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
            )
            .bind(key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|row| row.get::<Vec<u8>, _>("value")))
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        async move {
            let expires_at = ttl.map(|ttl| Utc::now().timestamp() + ttl.as_secs() as i64);
            sqlx::query(
                "INSERT INTO read_cache (key, value, expires_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            )
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

            debug!("Stored durable cache entry: {}", key);
            Ok(())
        }
        .boxed()
    }
}
