// Buffers decoded events per chunk and persists them at the chunk boundary.
//
// A flush drops events whose reference key is already stored, applies the
// rest in (block, tx, log) order, and runs each event's log insert and
// projection in one database transaction. An event that fails is rolled back
// and queued in `failed_event`; the rest of the flush continues.

use crate::blockchain::registry::ContractHandle;
use crate::db::{entities, failed_event, transaction_log};
use crate::models::EventRecord;
use crate::projection::{Projection, ProjectionError};
use crate::validation::normalize_address;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct ScanState {
    pool: SqlitePool,
    environment: String,
    min_block_number: u64,
    contracts: Vec<Arc<ContractHandle>>,
    buffer: Vec<(Arc<ContractHandle>, EventRecord)>,
}

impl ScanState {
    pub fn new(
        pool: SqlitePool,
        environment: &str,
        min_block_number: u64,
        contracts: Vec<Arc<ContractHandle>>,
    ) -> Self {
        Self {
            pool,
            environment: environment.to_string(),
            min_block_number,
            contracts,
            buffer: Vec::new(),
        }
    }

    pub fn start_chunk(&mut self) {
        self.buffer.clear();
    }

    pub fn process_event(&mut self, handle: Arc<ContractHandle>, event: EventRecord) {
        self.buffer.push((handle, event));
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Flushes the buffer and clears it, whatever the outcome.
    pub async fn end_chunk(&mut self) -> Result<FlushReport, StoreError> {
        let report = self.flush().await;
        self.buffer.clear();
        report
    }

    pub async fn flush(&mut self) -> Result<FlushReport, StoreError> {
        let mut report = FlushReport::default();
        if self.buffer.is_empty() {
            return Ok(report);
        }

        let keys: Vec<String> = self
            .buffer
            .iter()
            .map(|(_, event)| event.reference_key(&self.environment))
            .collect();
        let existing = transaction_log::existing_reference_keys(&self.pool, &keys).await?;

        let mut seen = HashSet::new();
        let mut pending: Vec<&(Arc<ContractHandle>, EventRecord)> = Vec::new();
        for (entry, key) in self.buffer.iter().zip(keys) {
            if existing.contains(&key) || !seen.insert(key) {
                report.duplicates += 1;
            } else {
                pending.push(entry);
            }
        }
        pending.sort_by_key(|(_, event)| event.ordering());

        debug!(
            "Flushing {} new events on {}: {:?}",
            pending.len(),
            self.environment,
            pending
                .iter()
                .map(|(_, e)| (e.event_name.as_str(), e.block_number, e.transaction_index, e.log_index))
                .collect::<Vec<_>>()
        );

        for (handle, event) in pending {
            match persist_event(&self.pool, &self.environment, handle, event).await {
                Ok(true) => report.persisted += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    error!(
                        "Failed to persist {} on {}: {}",
                        event.reference_key(&self.environment),
                        self.environment,
                        e
                    );
                    failed_event::record(&self.pool, &self.environment, event, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        info!(
            "Flushed {} events on {} ({} duplicates, {} failed)",
            report.persisted, self.environment, report.duplicates, report.failed
        );
        Ok(report)
    }

    /// Re-processes queued failed events of this environment's tracked
    /// contracts. Entries that succeed (or turn out to be persisted already)
    /// leave the queue.
    pub async fn replay_failed(&mut self) -> Result<FlushReport, StoreError> {
        let mut report = FlushReport::default();
        let mut queued = failed_event::list(&self.pool, &self.environment).await?;
        queued.sort_by_key(|failed| failed.event.ordering());

        for failed in queued {
            let Some(handle) = self.handle_for(&failed.event.address) else {
                continue;
            };

            match persist_event(&self.pool, &self.environment, &handle, &failed.event).await {
                Ok(inserted) => {
                    failed_event::remove(&self.pool, &failed.reference_key).await?;
                    if inserted {
                        report.persisted += 1;
                    } else {
                        report.duplicates += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        "Replay of {} failed again (attempt {}): {}",
                        failed.reference_key,
                        failed.attempts + 1,
                        e
                    );
                    failed_event::record(&self.pool, &self.environment, &failed.event, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        if report != FlushReport::default() {
            info!(
                "Replayed failed events on {}: {} persisted, {} already present, {} still failing",
                self.environment, report.persisted, report.duplicates, report.failed
            );
        }
        Ok(report)
    }

    /// Highest persisted block for the tracked contracts, never below the
    /// configured minimum. With nothing persisted it is the minimum, or 1.
    pub async fn last_scanned_block(&self) -> Result<u64, StoreError> {
        let addresses: Vec<String> = self.contracts.iter().map(|c| c.address_key()).collect();

        let projection: Option<Arc<dyn Projection>> =
            self.contracts.iter().flat_map(|c| c.projections()).next();
        let last = match projection {
            Some(projection) => projection.last_block(&self.pool, &self.environment, &addresses).await?,
            None => transaction_log::max_block_number(&self.pool, &self.environment, &addresses).await?,
        };

        Ok(match last {
            Some(block) => block.max(self.min_block_number),
            None if self.min_block_number == 0 => 1,
            None => self.min_block_number,
        })
    }

    fn handle_for(&self, address: &str) -> Option<Arc<ContractHandle>> {
        let address = normalize_address(address).ok()?;
        self.contracts.iter().find(|c| c.address() == address).cloned()
    }
}

/// Persists one event and applies its projection atomically. Returns `false`
/// when the log row already existed, in which case the projection is skipped.
async fn persist_event(
    pool: &SqlitePool,
    environment: &str,
    handle: &ContractHandle,
    event: &EventRecord,
) -> Result<bool, StoreError> {
    let mut tx = pool.begin().await?;

    let environment_id = entities::environment_id(&mut *tx, environment).await?;
    let block_id =
        entities::block_id(&mut *tx, environment_id, event.block_number, event.timestamp.timestamp()).await?;
    let txn_id = entities::txn_id(&mut *tx, block_id, &event.txhash, event.transaction_index).await?;
    let event_name_id = entities::event_name_id(&mut *tx, &event.event_name).await?;
    let contract_id = entities::contract_id(&mut *tx, &handle.address_key(), environment_id).await?;

    let inserted = transaction_log::insert_log(
        &mut *tx,
        txn_id,
        contract_id,
        event_name_id,
        event.log_index,
        &Value::Object(event.args.clone()),
        &event.reference_key(environment),
    )
    .await?;

    if inserted {
        if let Some(projection) = handle.callback(&event.event_name) {
            projection.apply_event(&mut *tx, contract_id, event).await?;
        }
    }

    tx.commit().await?;
    Ok(inserted)
}
