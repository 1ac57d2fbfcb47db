// Walks a block range in adaptive chunks, fetching and decoding the logs of
// every tracked contract and handing them to the scan state store.
//
// Chunks run strictly one after another. A failed eth_getLogs halves the
// remaining range and retries after a fixed delay; once the retries run out
// the scan fails and the chunk is not flushed.

use crate::blockchain::client::{ChainRpc, ClientError};
use crate::blockchain::processor::{self, DecodeError};
use crate::blockchain::registry::ContractHandle;
use crate::blockchain::scan_state::{ScanState, StoreError};
use crate::models::EventRecord;
use crate::validation::validate_block_range;
use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use backon::{ConstantBuilder, Retryable};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Chunk size multiplier after a chunk that produced events.
const SHRINK_FACTOR: f64 = 0.5;
/// Chunk size multiplier after an empty chunk.
const GROWTH_FACTOR: f64 = 2.0;

const TIMESTAMP_RETRIES: usize = 3;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid scan range: {start} > {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("eth_getLogs failed for blocks {from}..={to} after all retries: {source}")]
    RetriesExhausted {
        from: u64,
        to: u64,
        #[source]
        source: ClientError,
    },

    #[error("RPC error: {0}")]
    Client(#[from] ClientError),

    #[error("Log rejected: {0}")]
    Decode(#[from] DecodeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
}

/// Next chunk size: halved after a hit, doubled after a miss, clamped to `[min, max]`.
pub fn estimate_next_chunk_size(current: u64, events_found: usize, min: u64, max: u64) -> u64 {
    let factor = if events_found > 0 { SHRINK_FACTOR } else { GROWTH_FACTOR };
    let next = (current as f64 * factor) as u64;
    next.clamp(min, max.max(min))
}

pub struct EventScanner {
    environment: String,
    client: Arc<dyn ChainRpc>,
    contracts: HashMap<Address, Arc<ContractHandle>>,
    settings: ScanSettings,
}

impl EventScanner {
    pub fn new(
        environment: &str,
        client: Arc<dyn ChainRpc>,
        contracts: Vec<Arc<ContractHandle>>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            client,
            contracts: contracts.into_iter().map(|c| (c.address(), c)).collect(),
            settings,
        }
    }

    /// Distinct topics across all tracked contracts, in first-seen order.
    pub fn topics(&self) -> Vec<B256> {
        let mut handles: Vec<&Arc<ContractHandle>> = self.contracts.values().collect();
        handles.sort_by_key(|h| h.address());

        let mut topics = Vec::new();
        for topic in handles.iter().flat_map(|h| h.scan_topics()) {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.contracts.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub async fn head_block(&self) -> Result<u64, ScanError> {
        let head = (|| async { self.client.block_number().await })
            .retry(self.lookup_backoff())
            .when(|e: &ClientError| e.is_transient())
            .await?;
        Ok(head)
    }

    /// Scans `[start_block, end_block]`. Returns every decoded event and the
    /// number of chunks scanned.
    pub async fn scan(
        &self,
        state: &mut ScanState,
        start_block: u64,
        end_block: u64,
    ) -> Result<(Vec<EventRecord>, u64), ScanError> {
        validate_block_range(start_block, end_block).map_err(|_| ScanError::InvalidRange {
            start: start_block,
            end: end_block,
        })?;

        let topics = self.topics();
        let addresses = self.addresses();
        let min_chunk = self.settings.min_chunk_size;
        let max_chunk = self.settings.max_chunk_size.max(min_chunk);

        let mut chunk_size = max_chunk;
        let mut current = start_block;
        let mut processed = Vec::new();
        let mut chunks_scanned = 0u64;
        let mut last_duration = Duration::ZERO;

        while current <= end_block {
            state.start_chunk();

            let candidate_end = current.saturating_add(chunk_size).min(end_block);
            info!(
                "Scanning {} blocks {}..={} (chunk size {}, last chunk took {:?})",
                self.environment, current, candidate_end, chunk_size, last_duration
            );

            let started = Instant::now();
            let (actual_end, events) = self.scan_chunk(&topics, &addresses, current, candidate_end).await?;

            let found = events.len();
            for (handle, event) in events {
                processed.push(event.clone());
                state.process_event(handle, event);
            }
            debug!("{} events buffered for blocks {}..={}", state.buffered(), current, actual_end);
            state.end_chunk().await?;

            chunks_scanned += 1;
            last_duration = started.elapsed();
            chunk_size = estimate_next_chunk_size(chunk_size, found, min_chunk, max_chunk);
            current = actual_end + 1;
        }

        Ok((processed, chunks_scanned))
    }

    /// Fetches and decodes one chunk. The returned end block may be lower than
    /// `end_block` when retries shrank the range; events past it are dropped
    /// and picked up by the next chunk.
    async fn scan_chunk(
        &self,
        topics: &[B256],
        addresses: &[Address],
        start_block: u64,
        end_block: u64,
    ) -> Result<(u64, Vec<(Arc<ContractHandle>, EventRecord)>), ScanError> {
        let mut end = end_block;
        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        let mut events = Vec::new();

        for topic in topics {
            let (logs, actual_end) = self.fetch_logs(*topic, addresses, start_block, end).await?;
            end = actual_end;

            for log in logs {
                let position = processor::log_position(&log)?;
                if position.block_number > end {
                    continue;
                }

                let Some(handle) = self.contracts.get(&log.inner.address) else {
                    debug!("Ignoring log from untracked contract {}", log.inner.address);
                    continue;
                };

                let timestamp = match timestamps.get(&position.block_number) {
                    Some(timestamp) => *timestamp,
                    None => {
                        let timestamp = self.block_timestamp(position.block_number).await?;
                        timestamps.insert(position.block_number, timestamp);
                        timestamp
                    }
                };

                match self.decode(handle, &log, timestamp) {
                    Ok(event) => events.push((handle.clone(), event)),
                    Err(e) => warn!("Skipping undecodable log in block {}: {}", position.block_number, e),
                }
            }
        }

        events.retain(|(_, event)| event.block_number <= end);
        Ok((end, events))
    }

    fn decode(&self, handle: &ContractHandle, log: &Log, timestamp: u64) -> Result<EventRecord, String> {
        let topic0 = log.inner.data.topics().first().ok_or_else(|| "log has no topics".to_string())?;
        let event = handle.abi_for_topic(topic0).map_err(|e| e.to_string())?;
        processor::decode_log(event, log, timestamp).map_err(|e| e.to_string())
    }

    /// eth_getLogs with range halving. Returns the logs and the end block they cover.
    async fn fetch_logs(
        &self,
        topic: B256,
        addresses: &[Address],
        from: u64,
        to: u64,
    ) -> Result<(Vec<Log>, u64), ScanError> {
        let mut to = to;
        let mut attempt = 0u32;

        loop {
            let filter = Filter::new()
                .address(addresses.to_vec())
                .event_signature(topic)
                .from_block(from)
                .to_block(to);

            match self.client.get_logs(&filter).await {
                Ok(logs) => return Ok((logs, to)),
                Err(e) if attempt + 1 < self.settings.max_retries => {
                    attempt += 1;
                    let shrunk = from + (to - from) / 2;
                    warn!(
                        "eth_getLogs {}..={} on {} failed ({}), retry {}/{} with end {} in {:?}",
                        from, to, self.environment, e, attempt, self.settings.max_retries, shrunk, self.settings.retry_delay
                    );
                    to = shrunk;
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(source) => return Err(ScanError::RetriesExhausted { from, to, source }),
            }
        }
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64, ScanError> {
        let timestamp = (|| async { self.client.block_timestamp(number).await })
            .retry(self.lookup_backoff())
            .when(|e: &ClientError| e.is_transient())
            .await?;
        Ok(timestamp)
    }

    fn lookup_backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.settings.retry_delay)
            .with_max_times(TIMESTAMP_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_shrinks_on_hits_and_grows_on_misses() {
        assert_eq!(estimate_next_chunk_size(4000, 3, 1000, 5000), 2000);
        assert_eq!(estimate_next_chunk_size(2000, 0, 1000, 5000), 4000);
    }

    #[test]
    fn test_chunk_size_stays_within_bounds() {
        let mut size = 5000;
        for found in [5, 5, 5, 5, 0, 0, 0, 0, 0, 7, 0] {
            size = estimate_next_chunk_size(size, found, 1000, 5000);
            assert!((1000..=5000).contains(&size));
        }
        assert_eq!(estimate_next_chunk_size(1000, 1, 1000, 5000), 1000);
        assert_eq!(estimate_next_chunk_size(5000, 0, 1000, 5000), 5000);
        // max below min collapses to min
        assert_eq!(estimate_next_chunk_size(300, 0, 1000, 500), 1000);
    }
}
