// Orchestrates scans: loads the registry from the descriptors, runs each
// (index, environment) unit from its checkpoint up to the current head, and
// exposes the administrative clear and balance queries.

use crate::blockchain::{
    ClientError, ContractHandle, EventScanner, RegistryError, ScanError, ScanSettings, ScanState, StoreError,
};
use crate::config::{ChainConfig, ConfigError};
use crate::db::{self, entities, token_balance, transaction_log};
use crate::models::TokenBalance;
use crate::projection::{Projection, ProjectionError};
use crate::state::AppState;
use crate::validation::{address_key, normalize_address, ValidationError};
use alloy::primitives::I256;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("RPC error: {0}")]
    Client(#[from] ClientError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{address} is not registered for index {index} on {environment}")]
    UnknownContract {
        index: String,
        environment: String,
        address: String,
    },

    #[error("Unknown index: {0}")]
    UnknownIndex(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub index: String,
    pub environment: String,
    pub contracts: Vec<String>,
    pub start_block: u64,
    pub end_block: u64,
    pub events: usize,
    pub chunks: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct AccountBalance {
    pub account: String,
    /// Sum across every environment and contract, as a signed decimal string.
    pub total: String,
    pub balances: Vec<TokenBalance>,
}

pub struct Indexer {
    state: Arc<AppState>,
}

impl Indexer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Registers every contract of every index. Entries without a chain
    /// descriptor or with an unusable ABI are skipped with a warning.
    pub fn bootstrap(&self) -> usize {
        let config = &self.state.config;
        let mut registered = 0;

        let mut indexes: Vec<_> = config.indexes.iter().collect();
        indexes.sort_by(|a, b| a.0.cmp(b.0));

        for (index, entries) in indexes {
            for entry in entries {
                if let Err(e) = config.chain(&entry.environment) {
                    warn!("Skipping {} for index {}: {}", entry.address, index, e);
                    continue;
                }

                match self.state.registry.register_entry(index, entry) {
                    Ok(_) => registered += 1,
                    Err(e) => warn!("Skipping {} on {} for index {}: {}", entry.address, entry.environment, index, e),
                }
            }
        }

        info!("Registered {} contracts", registered);
        registered
    }

    /// Runs every (index, environment) unit, a bounded number at a time.
    pub async fn run_all(&self) -> Vec<Result<RunSummary, IndexerError>> {
        let units = self.state.registry.units();
        let concurrency = num_cpus::get().max(1);

        stream::iter(units)
            .map(|(index, environment)| async move {
                let result = self.run_environment(&index, &environment).await;
                if let Err(e) = &result {
                    error!("Run of {} on {} failed: {}", index, environment, e);
                }
                result
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    /// Scans all contracts of `index` on `environment`.
    pub async fn run_environment(&self, index: &str, environment: &str) -> Result<RunSummary, IndexerError> {
        let contracts: Vec<Arc<ContractHandle>> = self
            .state
            .registry
            .contracts(index, environment)
            .into_iter()
            .filter(|handle| !handle.is_placeholder())
            .collect();

        self.run_contracts(index, environment, contracts).await
    }

    /// Scans a single registered contract.
    pub async fn update_events(&self, index: &str, environment: &str, address: &str) -> Result<RunSummary, IndexerError> {
        let handle = self
            .state
            .registry
            .lookup(index, environment, address)
            .filter(|handle| !handle.is_placeholder())
            .ok_or_else(|| IndexerError::UnknownContract {
                index: index.to_string(),
                environment: environment.to_string(),
                address: address.to_string(),
            })?;

        self.run_contracts(index, environment, vec![handle]).await
    }

    async fn run_contracts(
        &self,
        index: &str,
        environment: &str,
        contracts: Vec<Arc<ContractHandle>>,
    ) -> Result<RunSummary, IndexerError> {
        let started = Instant::now();
        let mut summary = RunSummary {
            index: index.to_string(),
            environment: environment.to_string(),
            contracts: contracts.iter().map(|c| c.address().to_checksum(None)).collect(),
            ..Default::default()
        };

        if contracts.is_empty() {
            info!("Nothing to scan for {} on {}", index, environment);
            return Ok(summary);
        }

        let chain = self.state.config.chain(environment)?;
        let client = self.state.connector.connect(&chain.provider)?;

        let mut state = ScanState::new(
            self.state.db_pool.clone(),
            environment,
            chain.min_block_number,
            contracts.clone(),
        );
        state.replay_failed().await?;

        let scanner = EventScanner::new(environment, client, contracts, self.scan_settings(chain));
        let start_block = state.last_scanned_block().await?;
        let end_block = scanner.head_block().await?;
        summary.start_block = start_block;
        summary.end_block = end_block;

        info!(
            "Scanning {} on {} for {:?} from block {} to {}",
            index, environment, summary.contracts, start_block, end_block
        );

        if start_block > end_block {
            info!("{} on {} is ahead of head block {}, nothing to do", index, environment, end_block);
            return Ok(summary);
        }

        let (events, chunks) = scanner.scan(&mut state, start_block, end_block).await?;
        summary.events = events.len();
        summary.chunks = chunks;
        summary.duration = started.elapsed();

        info!(
            "Finished {} on {}: {} events in {} chunks over blocks {}..={} in {:?}",
            index, environment, summary.events, summary.chunks, start_block, end_block, summary.duration
        );
        Ok(summary)
    }

    fn scan_settings(&self, chain: &ChainConfig) -> ScanSettings {
        let config = &self.state.config;
        ScanSettings {
            max_retries: config.scan_max_retries,
            retry_delay: config.scan_retry_delay,
            min_chunk_size: config.scan_min_chunk_size,
            max_chunk_size: chain.max_chunk_scan_size,
        }
    }

    /// Wipes the projection state and transaction logs of an index's
    /// contracts. Contracts of other indexes are left alone.
    pub async fn clear(&self, index: &str) -> Result<u64, IndexerError> {
        let handles = self.state.registry.index_contracts(index);
        if handles.is_empty() {
            return Err(IndexerError::UnknownIndex(index.to_string()));
        }

        let pairs: Vec<(String, String)> = handles
            .iter()
            .map(|h| (h.environment().to_string(), h.address_key()))
            .collect();
        let contract_ids = entities::existing_contract_ids(&self.state.db_pool, &pairs).await?;

        let mut projections: Vec<Arc<dyn Projection>> = Vec::new();
        for projection in handles.iter().flat_map(|h| h.projections()) {
            if !projections.iter().any(|p| p.name() == projection.name()) {
                projections.push(projection);
            }
        }

        let mut removed = 0;
        for projection in projections {
            removed += projection.clear(&self.state.db_pool, &contract_ids).await?;
        }
        removed += transaction_log::delete_logs_for_contracts(&self.state.db_pool, &contract_ids).await?;

        info!("Cleared index {}: {} rows removed", index, removed);
        Ok(removed)
    }

    /// Wipes all indexed data, resetting every checkpoint.
    pub async fn clear_all(&self) -> Result<(), IndexerError> {
        db::clear_all(&self.state.db_pool).await?;
        info!("Cleared all indexed data");
        Ok(())
    }

    /// Balances of `account` across every environment and contract.
    pub async fn balance_of(&self, account: &str) -> Result<AccountBalance, IndexerError> {
        let account = address_key(&normalize_address(account)?);
        let balances = token_balance::balances_for_account(&self.state.db_pool, &account).await?;
        let total: I256 = token_balance::total_balance(&self.state.db_pool, &account).await?;

        Ok(AccountBalance {
            account,
            total: total.to_string(),
            balances,
        })
    }
}
