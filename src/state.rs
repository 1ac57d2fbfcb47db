use crate::blockchain::{ContractRegistry, HttpConnector, ReadService, RpcConnector};
use crate::cache::{self, ReadCaches, SqliteCache};
use crate::config::Config;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

pub struct AppState {
    pub config: Config,
    pub db_pool: SqlitePool,
    pub connector: Arc<dyn RpcConnector>,
    pub reader: Arc<ReadService>,
    pub registry: Arc<ContractRegistry>,
}

impl AppState {
    /// Wires the read layer and an empty registry over the HTTP connector.
    pub fn new(config: Config, db_pool: SqlitePool) -> Self {
        let connector: Arc<dyn RpcConnector> = Arc::new(HttpConnector::new(
            Duration::from_secs(config.rpc_timeout_secs),
            config.rpc_rate_limit,
        ));
        Self::with_connector(config, db_pool, connector)
    }

    pub fn with_connector(config: Config, db_pool: SqlitePool, connector: Arc<dyn RpcConnector>) -> Self {
        let caches = ReadCaches::new(
            Arc::new(cache::init_cache(&config)),
            Arc::new(SqliteCache::new(db_pool.clone())),
            config.cache_ttl,
        );
        let reader = Arc::new(ReadService::new(&config, connector.clone(), caches));
        let registry = Arc::new(ContractRegistry::new(reader.clone(), config.abi_dir.clone()));

        Self {
            config,
            db_pool,
            connector,
            reader,
            registry,
        }
    }
}
