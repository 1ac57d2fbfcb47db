use crate::blockchain::read::{block_label, read_key, ReadError, ReadService};
use crate::cache::CacheKey;
use crate::config::ChainConfig;
use alloy::dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier};
use alloy::eips::BlockId;
use alloy::hex;
use alloy::json_abi::Function;
use alloy::primitives::{address, Address, Bytes};
use alloy::sol;
use alloy::sol_types::SolCall;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

sol! {
    interface IMulticall {
        struct Call {
            address target;
            bytes callData;
        }

        function aggregate(Call[] calls) external returns (uint256 blockNumber, bytes[] returnData);
    }
}

/// Canonical Multicall3 deployment, present on most EVM chains.
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

const KNOWN_DEPLOYMENTS: &[(&str, &str)] = &[
    ("mainnet", "0x41263cba59eb80dc200f3e2544eda4ed6a90e76c"),
    ("testnet", "0xae11C5B5f29A6a25e955F0CB8ddCc416f522AF5C"),
    ("mumbai-test", "0xa1D6a0B3bE26FA898340b53d130FaAc855B87545"),
    ("fuji-test", "0x3525056b441957683c646e60f155A5db6390144F"),
    ("avalanche-mainnet", "0x115452aF3dD96809F61777010215219B8B30819D"),
    ("fantom-test", "0x0f0142450b65E562dbe871975da7ED0974e20D0e"),
    ("arbitrum-test", "0x06601d941386BA24575EE8A4Ec7E2E8cc7d81A1A"),
    ("ropsten", "0x53c43764255c17bd724f74c4ef150724ac50a3ed"),
    ("aurora-test", "0xE0F5c16d1f6FdC77C8e32eA22e56f115310ec61e"),
];

#[derive(Error, Debug)]
pub enum MulticallError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("Failed to decode aggregate result: {0}")]
    Decode(String),

    #[error("Invalid multicall address for {environment}: {address}")]
    InvalidAddress { environment: String, address: String },

    #[error("Aggregate returned {got} results for {expected} calls")]
    ResultCount { expected: usize, got: usize },
}

/// Aggregator address for `environment`: the configured override, the known
/// deployment for that network, or Multicall3.
pub fn multicall_address(environment: &str, chain: Option<&ChainConfig>) -> Result<Address, MulticallError> {
    if let Some(configured) = chain.and_then(|c| c.multicall_address.as_deref()) {
        return Address::from_str(configured).map_err(|_| MulticallError::InvalidAddress {
            environment: environment.to_string(),
            address: configured.to_string(),
        });
    }

    match KNOWN_DEPLOYMENTS.iter().find(|(env, _)| *env == environment) {
        Some((_, known)) => Address::from_str(known).map_err(|_| MulticallError::InvalidAddress {
            environment: environment.to_string(),
            address: known.to_string(),
        }),
        None => Ok(MULTICALL3_ADDRESS),
    }
}

/// One call inside a batch.
#[derive(Debug, Clone)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
    pub output_types: Vec<DynSolType>,
    /// Key a direct read of the same call would be cached under.
    pub cache_key: Option<CacheKey>,
}

impl Call {
    pub fn new(target: Address, call_data: Bytes, output_types: Vec<DynSolType>) -> Self {
        Self {
            target,
            call_data,
            output_types,
            cache_key: None,
        }
    }

    /// Encodes `function(args)` against `target` and keeps its read cache key.
    pub fn function(
        target: Address,
        environment: &str,
        function: &Function,
        args: &[DynSolValue],
        block: BlockId,
    ) -> Result<Self, MulticallError> {
        let call_data = function
            .abi_encode_input(args)
            .map_err(|e| ReadError::Encode(e.to_string()))?;
        let output_types = function
            .outputs
            .iter()
            .map(|param| param.resolve())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ReadError::Encode(e.to_string()))?;

        Ok(Self {
            target,
            call_data: call_data.into(),
            output_types,
            cache_key: Some(read_key(&target, environment, function, args, block)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    Decoded(Vec<DynSolValue>),
    /// Return data that did not decode under the declared output types.
    Raw(Bytes),
    /// The call returned no data.
    Empty,
}

pub struct Multicall {
    reader: Arc<ReadService>,
    environment: String,
    address: Address,
}

impl Multicall {
    pub fn new(reader: Arc<ReadService>, environment: &str, address: Address) -> Self {
        Self {
            reader,
            environment: environment.to_string(),
            address,
        }
    }

    pub fn for_environment(
        reader: Arc<ReadService>,
        environment: &str,
        chain: Option<&ChainConfig>,
    ) -> Result<Self, MulticallError> {
        let address = multicall_address(environment, chain)?;
        Ok(Self::new(reader, environment, address))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Runs `calls` in one `aggregate` call. Results come back in call order.
    pub async fn aggregate(&self, calls: &[Call], block: BlockId) -> Result<Vec<CallOutput>, MulticallError> {
        let return_data = self.aggregate_raw(calls, block).await?;

        Ok(calls
            .iter()
            .zip(return_data.iter())
            .map(|(call, data)| decode_output(call, data))
            .collect())
    }

    /// Like [`Multicall::aggregate`], and additionally caches each result under
    /// the key a direct read of that call would use.
    pub async fn cached_aggregate(&self, calls: &[Call], block: BlockId) -> Result<Vec<CallOutput>, MulticallError> {
        let return_data = self.aggregate_raw(calls, block).await?;

        let mut outputs = Vec::with_capacity(calls.len());
        for (call, data) in calls.iter().zip(return_data.iter()) {
            if let Some(key) = &call.cache_key {
                self.reader.cache_result(key, data.to_vec()).await;
            }
            outputs.push(decode_output(call, data));
        }

        Ok(outputs)
    }

    async fn aggregate_raw(&self, calls: &[Call], block: BlockId) -> Result<Vec<Bytes>, MulticallError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let envelope = IMulticall::aggregateCall {
            calls: calls
                .iter()
                .map(|call| IMulticall::Call {
                    target: call.target,
                    callData: call.call_data.clone(),
                })
                .collect(),
        }
        .abi_encode();

        let key = CacheKey::contract_read(
            &format!("{:#x}", self.address),
            &self.environment,
            "aggregate((address,bytes)[])",
            &block_label(block),
            &hex::encode_prefixed(&envelope),
        );

        debug!("Aggregating {} calls on {} via {}", calls.len(), self.environment, self.address);
        let output = self
            .reader
            .call(&self.environment, self.address, envelope.into(), block, &key)
            .await?;

        let decoded = IMulticall::aggregateCall::abi_decode_returns(&output)
            .map_err(|e| MulticallError::Decode(e.to_string()))?;

        if decoded.returnData.len() != calls.len() {
            return Err(MulticallError::ResultCount {
                expected: calls.len(),
                got: decoded.returnData.len(),
            });
        }

        Ok(decoded.returnData)
    }
}

/// Decodes one call's return data, falling back to the raw bytes.
pub fn decode_output(call: &Call, data: &Bytes) -> CallOutput {
    if data.is_empty() {
        return CallOutput::Empty;
    }

    match DynSolType::Tuple(call.output_types.clone()).abi_decode_sequence(data) {
        Ok(DynSolValue::Tuple(values)) => CallOutput::Decoded(values),
        Ok(other) => CallOutput::Decoded(vec![other]),
        Err(e) => {
            warn!("Could not decode multicall result for {}: {}", call.target, e);
            CallOutput::Raw(data.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn test_known_and_fallback_addresses() {
        assert_eq!(
            multicall_address("fuji-test", None).unwrap(),
            Address::from_str("0x3525056b441957683c646e60f155A5db6390144F").unwrap()
        );
        assert_eq!(multicall_address("base-mainnet", None).unwrap(), MULTICALL3_ADDRESS);
    }

    #[test]
    fn test_decode_output_falls_back_to_raw() {
        let call = Call::new(Address::ZERO, Bytes::new(), vec![DynSolType::Uint(256)]);

        let word = Bytes::from(U256::from(42u64).to_be_bytes::<32>().to_vec());
        assert_eq!(
            decode_output(&call, &word),
            CallOutput::Decoded(vec![DynSolValue::Uint(U256::from(42u64), 256)])
        );

        let short = Bytes::from(vec![1u8, 2, 3]);
        assert_eq!(decode_output(&call, &short), CallOutput::Raw(short.clone()));
        assert_eq!(decode_output(&call, &Bytes::new()), CallOutput::Empty);
    }
}
