use alloy::eips::BlockId;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy::transports::http::{reqwest, Http};
use alloy::transports::{RpcError, TransportError};
use futures::future::BoxFuture;
use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Execution reverted: {0}")]
    Reverted(String),

    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    #[error("Invalid RPC url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Errors worth retrying against the same or another endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Rpc { .. } | ClientError::Timeout(_)
        )
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match &err {
            RpcError::ErrorResp(payload) => {
                let message = payload.message.to_string();
                // Code 3 is the standard "execution reverted" error of eth_call.
                if payload.code == 3 || message.contains("revert") {
                    ClientError::Reverted(message)
                } else {
                    ClientError::Rpc {
                        code: payload.code,
                        message,
                    }
                }
            }
            _ => {
                let message = err.to_string();
                if message.contains("timed out") {
                    ClientError::Timeout(message)
                } else {
                    ClientError::Transport(message)
                }
            }
        }
    }
}

/// The JSON-RPC surface the indexer consumes from a chain node.
pub trait ChainRpc: Send + Sync {
    fn url(&self) -> &str;

    fn block_number(&self) -> BoxFuture<'_, Result<u64, ClientError>>;

    fn get_logs<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<Vec<Log>, ClientError>>;

    /// Mined timestamp (unix seconds) of a block.
    fn block_timestamp(&self, number: u64) -> BoxFuture<'_, Result<u64, ClientError>>;

    fn call(&self, to: Address, data: Bytes, block: BlockId) -> BoxFuture<'_, Result<Bytes, ClientError>>;

    fn balance(&self, address: Address, block: BlockId) -> BoxFuture<'_, Result<U256, ClientError>>;
}

/// Opens clients for provider urls.
pub trait RpcConnector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn ChainRpc>, ClientError>;
}

/// HTTP JSON-RPC client for one endpoint, with an optional request rate limit.
pub struct EvmClient {
    url: String,
    provider: RootProvider,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl EvmClient {
    pub fn new(url: &str, timeout: Duration, rate_limit: Option<u32>) -> Result<Self, ClientError> {
        let parsed: reqwest::Url = url
            .parse()
            .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let transport = Http::with_client(http_client, parsed);
        let is_local = transport.guess_local();
        let provider = RootProvider::new(RpcClient::new(transport, is_local));

        let limiter = rate_limit
            .and_then(NonZeroU32::new)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));

        info!(
            "Initializing EVM client with RPC endpoint: {}, timeout: {:?}, rate limit: {:?}",
            url, timeout, rate_limit
        );

        Ok(Self {
            url: url.to_string(),
            provider,
            limiter,
        })
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

impl ChainRpc for EvmClient {
    fn url(&self) -> &str {
        &self.url
    }

    fn block_number(&self) -> BoxFuture<'_, Result<u64, ClientError>> {
        async move {
            self.throttle().await;
            Ok(self.provider.get_block_number().await?)
        }
        .boxed()
    }

    fn get_logs<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<Vec<Log>, ClientError>> {
        async move {
            self.throttle().await;
            debug!("eth_getLogs on {}: {:?}", self.url, filter);
            Ok(self.provider.get_logs(filter).await?)
        }
        .boxed()
    }

    fn block_timestamp(&self, number: u64) -> BoxFuture<'_, Result<u64, ClientError>> {
        async move {
            self.throttle().await;
            let block = self
                .provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .await?
                .ok_or(ClientError::BlockNotFound(number))?;
            Ok(block.header.inner.timestamp)
        }
        .boxed()
    }

    fn call(&self, to: Address, data: Bytes, block: BlockId) -> BoxFuture<'_, Result<Bytes, ClientError>> {
        async move {
            self.throttle().await;
            let tx = TransactionRequest::default().to(to).input(data.into());
            Ok(self.provider.call(tx).block(block).await?)
        }
        .boxed()
    }

    fn balance(&self, address: Address, block: BlockId) -> BoxFuture<'_, Result<U256, ClientError>> {
        async move {
            self.throttle().await;
            Ok(self.provider.get_balance(address).block_id(block).await?)
        }
        .boxed()
    }
}

/// Connector that reuses one [`EvmClient`] per url.
pub struct HttpConnector {
    timeout: Duration,
    rate_limit: Option<u32>,
    clients: Mutex<HashMap<String, Arc<dyn ChainRpc>>>,
}

impl HttpConnector {
    pub fn new(timeout: Duration, rate_limit: Option<u32>) -> Self {
        Self {
            timeout,
            rate_limit,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl RpcConnector for HttpConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn ChainRpc>, ClientError> {
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(client) = clients.get(url) {
            return Ok(client.clone());
        }

        let client: Arc<dyn ChainRpc> = Arc::new(EvmClient::new(url, self.timeout, self.rate_limit)?);
        clients.insert(url.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Transport("503".to_string()).is_transient());
        assert!(ClientError::Rpc { code: -32005, message: "limit exceeded".to_string() }.is_transient());
        assert!(ClientError::Timeout("operation timed out".to_string()).is_transient());
        assert!(!ClientError::Reverted("execution reverted".to_string()).is_transient());
        assert!(!ClientError::BlockNotFound(1).is_transient());
    }

    #[test]
    fn test_connector_rejects_bad_url_and_reuses_clients() {
        let connector = HttpConnector::new(Duration::from_secs(5), None);
        assert!(matches!(
            connector.connect("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));

        let first = connector.connect("http://localhost:8545").unwrap();
        let second = connector.connect("http://localhost:8545").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.url(), "http://localhost:8545");
    }
}
