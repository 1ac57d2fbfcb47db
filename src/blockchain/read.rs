// Single on-chain reads with provider failover.
//
// Every successful result lands in two caches: the short-TTL cache answers
// repeated reads, the durable cache is only consulted after every provider
// failed. The last provider that answered is remembered per environment and
// tried first on the next read.

use crate::blockchain::client::{ChainRpc, ClientError, RpcConnector};
use crate::cache::{CacheKey, ReadCaches};
use crate::config::{ChainConfig, Config};
use crate::validation::{address_key, normalize_address, ValidationError};
use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::eips::BlockId;
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::BlockNumberOrTag;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const DESCRIPTION_LIMIT: usize = 200;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    InvalidAddress(#[from] ValidationError),

    #[error("Function not found in ABI: {0}")]
    FunctionNotFound(String),

    #[error("Failed to encode call: {0}")]
    Encode(String),

    #[error("Failed to decode return data: {0}")]
    Decode(String),

    #[error("RPC error: {0}")]
    Client(#[from] ClientError),

    #[error("No providers available for {0}")]
    NoProvidersAvailable(String),

    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),
}

pub struct ReadService {
    chains: HashMap<String, ChainConfig>,
    connector: Arc<dyn RpcConnector>,
    caches: ReadCaches,
    max_attempts: usize,
}

impl ReadService {
    pub fn new(config: &Config, connector: Arc<dyn RpcConnector>, caches: ReadCaches) -> Self {
        Self {
            chains: config.chains.clone(),
            connector,
            caches,
            max_attempts: config.read_max_attempts.max(1),
        }
    }

    /// Calls `function_name` on `contract_address` and decodes its outputs.
    pub async fn read(
        &self,
        contract_address: &str,
        environment: &str,
        abi: &JsonAbi,
        function_name: &str,
        args: &[DynSolValue],
        block: BlockId,
    ) -> Result<Vec<DynSolValue>, ReadError> {
        let address = normalize_address(contract_address)?;
        let function = select_function(abi, function_name, args.len())?;
        let call_data = function
            .abi_encode_input(args)
            .map_err(|e| ReadError::Encode(e.to_string()))?;

        let key = read_key(&address, environment, function, args, block);
        debug!(
            "{}",
            truncate(
                &format!("read {}.{}({:?}) on {} at {}", address, function_name, args, environment, block_label(block)),
                DESCRIPTION_LIMIT
            )
        );

        let output = self.call(environment, address, call_data.into(), block, &key).await?;
        function
            .abi_decode_output(&output)
            .map_err(|e| ReadError::Decode(e.to_string()))
    }

    /// `eth_call` with caching and failover; returns the raw return data.
    pub async fn call(
        &self,
        environment: &str,
        to: Address,
        data: Bytes,
        block: BlockId,
        key: &CacheKey,
    ) -> Result<Bytes, ReadError> {
        if let Some(cached) = self.cached(key).await {
            return Ok(Bytes::from(cached));
        }

        let result = self
            .with_failover(environment, |client| {
                let data = data.clone();
                async move { client.call(to, data, block).await }
            })
            .await?;

        match result {
            Some(output) => {
                self.store(key, output.to_vec()).await;
                Ok(output)
            }
            None => self.durable_fallback(environment, key).await.map(Bytes::from),
        }
    }

    /// Native asset balance of `address`, same failover and caching as [`ReadService::read`].
    pub async fn read_balance(&self, address: &str, environment: &str, block: BlockId) -> Result<U256, ReadError> {
        let address = normalize_address(address)?;
        let key = CacheKey::balance(&address_key(&address), environment, &block_label(block));

        if let Some(cached) = self.cached(&key).await {
            return Ok(U256::from_be_slice(&cached));
        }

        let result = self
            .with_failover(environment, |client| async move { client.balance(address, block).await })
            .await?;

        match result {
            Some(balance) => {
                self.store(&key, balance.to_be_bytes::<32>().to_vec()).await;
                Ok(balance)
            }
            None => self
                .durable_fallback(environment, &key)
                .await
                .map(|raw| U256::from_be_slice(&raw)),
        }
    }

    /// Writes a result into the short-TTL cache only.
    pub async fn cache_result(&self, key: &CacheKey, value: Vec<u8>) {
        if let Err(e) = self.caches.short.set(&key.storage_key(), value, Some(self.caches.ttl)).await {
            warn!("Failed to cache {}: {}", key, e);
        }
    }

    /// Providers in the order they are tried: last working, primary, backups.
    pub async fn provider_order(&self, environment: &str) -> Result<Vec<String>, ReadError> {
        let chain = self
            .chains
            .get(environment)
            .ok_or_else(|| ReadError::UnknownEnvironment(environment.to_string()))?;

        let mut order = Vec::with_capacity(chain.backup_providers.len() + 2);
        let working_key = CacheKey::working_provider(environment).storage_key();
        if let Ok(Some(raw)) = self.caches.short.get(&working_key).await {
            if let Ok(url) = String::from_utf8(raw) {
                order.push(url);
            }
        }

        for url in std::iter::once(&chain.provider).chain(chain.backup_providers.iter()) {
            if !order.contains(url) {
                order.push(url.clone());
            }
        }

        Ok(order)
    }

    /// Runs `op` against providers in order until one succeeds. Transient
    /// errors move on to the next provider, anything else is returned at once.
    /// `Ok(None)` means every attempt failed.
    async fn with_failover<T, F, Fut>(&self, environment: &str, op: F) -> Result<Option<T>, ReadError>
    where
        F: Fn(Arc<dyn ChainRpc>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let order = self.provider_order(environment).await?;

        for attempt in 0..self.max_attempts {
            let url = &order[attempt % order.len()];
            let client = match self.connector.connect(url) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Skipping provider {} for {}: {}", url, environment, e);
                    continue;
                }
            };

            match op(client).await {
                Ok(value) => {
                    self.remember_provider(environment, url).await;
                    return Ok(Some(value));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Provider {} failed for {} (attempt {}/{}): {}",
                        url,
                        environment,
                        attempt + 1,
                        self.max_attempts,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    async fn cached(&self, key: &CacheKey) -> Option<Vec<u8>> {
        match self.caches.short.get(&key.storage_key()).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, value: Vec<u8>) {
        if let Err(e) = self.caches.durable.set(&key.durable_key(), value.clone(), None).await {
            warn!("Failed to write durable cache for {}: {}", key, e);
        }
        self.cache_result(key, value).await;
    }

    async fn remember_provider(&self, environment: &str, url: &str) {
        let key = CacheKey::working_provider(environment).storage_key();
        if let Err(e) = self.caches.short.set(&key, url.as_bytes().to_vec(), None).await {
            warn!("Failed to remember provider for {}: {}", environment, e);
        }
    }

    async fn durable_fallback(&self, environment: &str, key: &CacheKey) -> Result<Vec<u8>, ReadError> {
        match self.caches.durable.get(&key.durable_key()).await {
            Ok(Some(value)) => {
                warn!("All providers failed for {}, serving durable cache entry", environment);
                Ok(value)
            }
            Ok(None) => Err(ReadError::NoProvidersAvailable(environment.to_string())),
            Err(e) => {
                warn!("Durable cache lookup failed for {}: {}", key, e);
                Err(ReadError::NoProvidersAvailable(environment.to_string()))
            }
        }
    }
}

/// Picks the overload of `name` taking `arity` arguments.
pub fn select_function<'a>(abi: &'a JsonAbi, name: &str, arity: usize) -> Result<&'a Function, ReadError> {
    abi.function(name)
        .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arity))
        .ok_or_else(|| ReadError::FunctionNotFound(name.to_string()))
}

/// Cache key of a contract read; shared with the multicall aggregator.
pub fn read_key(
    address: &Address,
    environment: &str,
    function: &Function,
    args: &[DynSolValue],
    block: BlockId,
) -> CacheKey {
    CacheKey::contract_read(
        &address_key(address),
        environment,
        &function.signature(),
        &block_label(block),
        &format!("{:?}", args),
    )
}

pub fn block_label(block: BlockId) -> String {
    match block {
        BlockId::Number(BlockNumberOrTag::Number(number)) => number.to_string(),
        BlockId::Number(tag) => format!("{:?}", tag).to_lowercase(),
        BlockId::Hash(hash) => format!("{:#x}", hash.block_hash),
    }
}

fn truncate(description: &str, limit: usize) -> &str {
    match description.char_indices().nth(limit) {
        Some((idx, _)) => &description[..idx],
        None => description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_label() {
        assert_eq!(block_label(BlockId::number(1234)), "1234");
        assert_eq!(block_label(BlockId::latest()), "latest");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_select_function_by_arity() {
        let abi: JsonAbi = serde_json::from_str(
            r#"[
                {"type":"function","name":"balanceOf","stateMutability":"view",
                 "inputs":[{"name":"account","type":"address"}],
                 "outputs":[{"name":"","type":"uint256"}]}
            ]"#,
        )
        .unwrap();

        assert!(select_function(&abi, "balanceOf", 1).is_ok());
        assert!(matches!(
            select_function(&abi, "balanceOf", 2),
            Err(ReadError::FunctionNotFound(_))
        ));
        assert!(matches!(
            select_function(&abi, "totalSupply", 0),
            Err(ReadError::FunctionNotFound(_))
        ));
    }
}
