// Decoded event records handed from the scanner to the scan state store,
// and the persisted row shapes read back out of the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One decoded log occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub log_index: u64,
    pub transaction_index: u64,
    pub txhash: String,
    pub block_number: u64,
    /// Emitting contract, checksummed.
    pub address: String,
    /// Decoded event arguments keyed by parameter name.
    pub args: Map<String, Value>,
}

impl EventRecord {
    /// Idempotency key: `{environment}-{block_number}-{tx_index}-{log_index}`.
    pub fn reference_key(&self, environment: &str) -> String {
        reference_key(
            environment,
            self.block_number,
            self.transaction_index,
            self.log_index,
        )
    }

    /// Causal application order within and across blocks.
    pub fn ordering(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

pub fn reference_key(environment: &str, block_number: u64, tx_index: u64, log_index: u64) -> String {
    format!("{}-{}-{}-{}", environment, block_number, tx_index, log_index)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLog {
    pub reference_key: String,
    pub environment: String,
    pub contract_address: String,
    pub event_name: String,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub txhash: String,
    pub transaction_index: i64,
    pub log_index: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    pub environment: String,
    pub contract_address: String,
    pub account: String,
    /// Signed decimal string; token amounts exceed i64.
    pub balance: String,
}
