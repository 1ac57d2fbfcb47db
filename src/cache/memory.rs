//! In-memory cache with per-entry TTL using Moka

use super::{CacheError, CachePort};
use futures::future::BoxFuture;
use futures::FutureExt;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    ttl: Option<Duration>,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Process-wide cache for read results and provider bookkeeping
#[derive(Clone)]
pub struct MemoryCache {
    cache: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryExpiry)
            .build();

        Self { cache }
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
        debug!("Invalidated cache entry: {}", key);
    }
}

impl CachePort for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, CacheError>> {
        async move {
            let result = self.cache.get(key).await.map(|entry| entry.value);
            if result.is_some() {
                debug!("Cache hit for key: {}", key);
            } else {
                debug!("Cache miss for key: {}", key);
            }
            Ok(result)
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
            self.cache.insert(key.to_string(), Entry { value, ttl }).await;
            Ok(())
        }
        .boxed()
    }
}
