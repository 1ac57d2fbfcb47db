// Turns raw logs into `EventRecord`s.

use crate::models::EventRecord;
use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::hex;
use alloy::json_abi::Event;
use alloy::rpc::types::Log;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    /// Pending logs carry no position yet.
    #[error("Log has no {0}, it is not mined")]
    NotMined(&'static str),

    #[error("Failed to decode {event}: {reason}")]
    Abi { event: String, reason: String },

    #[error("Invalid block timestamp: {0}")]
    Timestamp(u64),
}

/// Position of a mined log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

pub fn log_position(log: &Log) -> Result<LogPosition, DecodeError> {
    Ok(LogPosition {
        log_index: log.log_index.ok_or(DecodeError::NotMined("log index"))?,
        block_number: log.block_number.ok_or(DecodeError::NotMined("block number"))?,
        transaction_index: log.transaction_index.ok_or(DecodeError::NotMined("transaction index"))?,
    })
}

/// Decodes `log` with `event` into a record stamped with the block's timestamp.
pub fn decode_log(event: &Event, log: &Log, block_timestamp: u64) -> Result<EventRecord, DecodeError> {
    let position = log_position(log)?;
    let txhash = log
        .transaction_hash
        .ok_or(DecodeError::NotMined("transaction hash"))?;
    let timestamp = DateTime::<Utc>::from_timestamp(block_timestamp as i64, 0)
        .ok_or(DecodeError::Timestamp(block_timestamp))?;

    let decoded = event.decode_log(&log.inner.data).map_err(|e| DecodeError::Abi {
        event: event.name.clone(),
        reason: e.to_string(),
    })?;

    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut args = Map::new();
    for (position, input) in event.inputs.iter().enumerate() {
        let value = if input.indexed { indexed.next() } else { body.next() };
        let Some(value) = value else {
            return Err(DecodeError::Abi {
                event: event.name.clone(),
                reason: format!("missing value for input {}", position),
            });
        };

        let name = if input.name.is_empty() {
            format!("arg{}", position)
        } else {
            input.name.clone()
        };
        args.insert(name, value_to_json(&value));
    }

    Ok(EventRecord {
        event_name: event.name.clone(),
        timestamp,
        log_index: position.log_index,
        transaction_index: position.transaction_index,
        txhash: format!("{:#x}", txhash),
        block_number: position.block_number,
        address: log.inner.address.to_checksum(None),
        args,
    })
}

/// JSON form of a decoded ABI value. Integers become decimal strings so
/// 256-bit amounts survive the round trip.
pub fn value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => Value::String(hex::encode_prefixed(&word[..*size])),
        DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
        DynSolValue::Function(function) => Value::String(hex::encode_prefixed(function.as_slice())),
        DynSolValue::Bytes(bytes) => Value::String(hex::encode_prefixed(bytes)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) | DynSolValue::Tuple(values) => {
            Value::Array(values.iter().map(value_to_json).collect())
        }
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{:?}", other)),
    }
}
