// Configuration structure for:
// - Database connection string
// - Chain descriptors (providers, min block, chunk size) per environment
// - Contracts tracked per index
// - Read cache settings (size, TTL)
// - RPC / scan retry tuning

use dotenv::dotenv;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No chain descriptor for environment: {0}")]
    UnknownEnvironment(String),
}

/// Per-environment chain descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Earliest block worth scanning, usually the lowest creation block of the tracked contracts.
    #[serde(default)]
    pub min_block_number: u64,
    pub provider: String,
    #[serde(default)]
    pub backup_providers: Vec<String>,
    #[serde(default = "default_max_chunk_scan_size")]
    pub max_chunk_scan_size: u64,
    pub chain_id: u64,
    #[serde(default)]
    pub gas_price: f64,
    #[serde(default)]
    pub explorer_api: Option<String>,
    #[serde(default)]
    pub explorer_key: Option<String>,
    #[serde(default)]
    pub multicall_address: Option<String>,
}

fn default_max_chunk_scan_size() -> u64 {
    5000
}

/// A contract tracked by an index.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractEntry {
    pub environment: String,
    pub address: String,
    #[serde(default)]
    pub abi_path: Option<String>,
    /// Restricts the scanned topics to these event names when non-empty.
    #[serde(default)]
    pub events_to_scan: Vec<String>,
    /// Projection handling this contract's events, by projection name.
    #[serde(default)]
    pub projection: Option<String>,
}

/// Contents of the descriptor file pointed to by `INDEXER_CONFIG`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexerFile {
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub indexes: HashMap<String, Vec<ContractEntry>>,
}

impl IndexerFile {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub indexer_config_path: PathBuf,
    pub abi_dir: PathBuf,
    pub cache_ttl: Duration,
    pub cache_max_capacity: u64,
    pub rpc_timeout_secs: u64,
    pub rpc_rate_limit: Option<u32>,
    pub read_max_attempts: usize,
    pub scan_max_retries: u32,
    pub scan_retry_delay: Duration,
    pub scan_min_chunk_size: u64,
    pub polling_interval_secs: u64,
    pub chains: HashMap<String, ChainConfig>,
    pub indexes: HashMap<String, Vec<ContractEntry>>,
}

impl Config {
    /// Reads the environment (and `.env`). Chains and indexes stay empty until
    /// [`Config::load_descriptors`] is called.
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:indexer.db".to_string());
        let indexer_config_path = env::var("INDEXER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("indexer.json"));
        let abi_dir = env::var("ABI_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("abis"));
        let cache_ttl = env::var("CACHE_TTL")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(7));
        let cache_max_capacity = env::var("CACHE_MAX_CAPACITY")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .unwrap_or(10_000);
        let rpc_timeout_secs = env::var("RPC_TIMEOUT_SECS")
            .map(|v| v.parse().unwrap_or(30))
            .unwrap_or(30);
        let rpc_rate_limit = env::var("RPC_RATE_LIMIT")
            .map(|v| v.parse().ok())
            .unwrap_or(None);
        let read_max_attempts = env::var("READ_MAX_ATTEMPTS")
            .map(|v| v.parse().unwrap_or(15))
            .unwrap_or(15);
        let scan_max_retries = env::var("SCAN_MAX_RETRIES")
            .map(|v| v.parse().unwrap_or(30))
            .unwrap_or(30);
        let scan_retry_delay = env::var("SCAN_RETRY_DELAY_MS")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(3000));
        let scan_min_chunk_size = env::var("SCAN_MIN_CHUNK_SIZE")
            .map(|v| v.parse().unwrap_or(1000))
            .unwrap_or(1000);
        let polling_interval_secs = env::var("POLLING_INTERVAL_SECS")
            .map(|v| v.parse().unwrap_or(300))
            .unwrap_or(300);

        Self {
            database_url,
            indexer_config_path,
            abi_dir,
            cache_ttl,
            cache_max_capacity,
            rpc_timeout_secs,
            rpc_rate_limit,
            read_max_attempts,
            scan_max_retries,
            scan_retry_delay,
            scan_min_chunk_size,
            polling_interval_secs,
            chains: HashMap::new(),
            indexes: HashMap::new(),
        }
    }

    /// Loads chain and index descriptors from `indexer_config_path`.
    pub fn load_descriptors(mut self) -> Result<Self, ConfigError> {
        let file = IndexerFile::load(&self.indexer_config_path)?;
        self.chains = file.chains;
        self.indexes = file.indexes;
        Ok(self)
    }

    pub fn with_descriptors(mut self, file: IndexerFile) -> Self {
        self.chains = file.chains;
        self.indexes = file.indexes;
        self
    }

    pub fn chain(&self, environment: &str) -> Result<&ChainConfig, ConfigError> {
        self.chains
            .get(environment)
            .ok_or_else(|| ConfigError::UnknownEnvironment(environment.to_string()))
    }

    /// Environments that have both a chain descriptor and at least one tracked contract.
    pub fn tracked_environments(&self) -> Vec<String> {
        let mut environments: Vec<String> = self
            .indexes
            .values()
            .flatten()
            .map(|entry| entry.environment.clone())
            .filter(|environment| self.chains.contains_key(environment))
            .collect();
        environments.sort();
        environments.dedup();
        environments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "chains": {
            "avalanche-mainnet": {
                "min_block_number": 5000,
                "provider": "https://api.avax.network/ext/bc/C/rpc",
                "backup_providers": ["https://rpc.ankr.com/avalanche"],
                "max_chunk_scan_size": 3000,
                "chain_id": 43114,
                "gas_price": 25.0
            },
            "polygon-mainnet": {
                "provider": "https://polygon-rpc.com",
                "chain_id": 137
            }
        },
        "indexes": {
            "index_v1": [
                {
                    "environment": "avalanche-mainnet",
                    "address": "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E",
                    "abi_path": "ERC20.json",
                    "projection": "token_balance"
                },
                {
                    "environment": "fantom-test",
                    "address": "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"
                }
            ]
        }
    }"#;

    #[test]
    fn test_descriptor_parsing_and_defaults() {
        let file = IndexerFile::from_json(DESCRIPTOR).unwrap();
        let avalanche = &file.chains["avalanche-mainnet"];
        assert_eq!(avalanche.min_block_number, 5000);
        assert_eq!(avalanche.backup_providers.len(), 1);
        assert_eq!(avalanche.max_chunk_scan_size, 3000);

        let polygon = &file.chains["polygon-mainnet"];
        assert_eq!(polygon.min_block_number, 0);
        assert_eq!(polygon.max_chunk_scan_size, 5000);
        assert!(polygon.multicall_address.is_none());

        let entries = &file.indexes["index_v1"];
        assert_eq!(entries[0].projection.as_deref(), Some("token_balance"));
        assert!(entries[1].events_to_scan.is_empty());
    }

    #[test]
    fn test_tracked_environments_require_chain_descriptor() {
        let config = Config::from_env().with_descriptors(IndexerFile::from_json(DESCRIPTOR).unwrap());
        assert_eq!(config.tracked_environments(), vec!["avalanche-mainnet".to_string()]);
        assert!(matches!(
            config.chain("fantom-test"),
            Err(ConfigError::UnknownEnvironment(_))
        ));
    }
}
