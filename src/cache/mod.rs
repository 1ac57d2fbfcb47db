pub mod durable;
pub mod keys;
pub mod memory;

pub use durable::SqliteCache;
pub use keys::CacheKey;
pub use memory::MemoryCache;

use crate::config::Config;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Key-value cache port injected into the read layer and the multicall aggregator.
///
/// `ttl = None` stores the entry until it is overwritten or evicted.
pub trait CachePort: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, CacheError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// The two process-wide caches used by reads.
#[derive(Clone)]
pub struct ReadCaches {
    /// Short-TTL result cache, also holds the last working provider per environment.
    pub short: Arc<dyn CachePort>,
    /// Fallback entries without TTL, served when every provider failed.
    pub durable: Arc<dyn CachePort>,
    pub ttl: Duration,
}

impl ReadCaches {
    pub fn new(short: Arc<dyn CachePort>, durable: Arc<dyn CachePort>, ttl: Duration) -> Self {
        Self { short, durable, ttl }
    }
}

pub fn init_cache(config: &Config) -> MemoryCache {
    MemoryCache::new(config.cache_max_capacity)
}
