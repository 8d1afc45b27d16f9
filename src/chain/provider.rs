//! Chain provider with multi-RPC support and automatic failover

use crate::chain::LogSource;
use crate::config::ChainConfig;
use crate::error::{SubmitterError, SubmitterResult};
use crate::txmgr::{PublisherBackend, ReceiptSource, SignedTransaction, TxMgrError, TxMgrResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> SubmitterResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SubmitterError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let provider = Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        };

        // A provider for the wrong network would sign replayable txs elsewhere.
        match provider.with_failover("eth_chainId", |p| async move { p.get_chainid().await }).await {
            Ok(remote) if remote.as_u64() != provider.config.chain_id => {
                return Err(SubmitterError::Config(format!(
                    "{} RPC reports chain id {}, expected {}",
                    provider.config.name, remote, provider.config.chain_id
                )));
            }
            Ok(_) => info!(
                "Connected to {} (chain {})",
                provider.config.name, provider.config.chain_id
            ),
            Err(e) => warn!(
                "Unable to verify chain id for {}: {}",
                provider.config.name, e
            ),
        }

        Ok(provider)
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(
            "Chain {} failover to provider {}",
            self.config.chain_id, next
        );
    }

    /// Runs `op` against the active provider, failing over on transport
    /// errors. Errors returned by the node itself are not retried.
    async fn with_failover<T, F, Fut>(&self, method: &str, op: F) -> TxMgrResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match op(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if RpcError::as_error_response(&e).is_some() => {
                    return Err(TxMgrError::from_rpc_error(e.to_string()));
                }
                Err(e) => {
                    warn!(
                        "{} failed on chain {}: {}",
                        method, self.config.chain_id, e
                    );
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(TxMgrError::Rpc(format!(
            "all providers failed for {}: {}",
            method,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

#[async_trait]
impl ReceiptSource for ChainProvider {
    async fn block_number(&self) -> TxMgrResult<u64> {
        let block = self
            .with_failover("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await?;
        Ok(block.as_u64())
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> TxMgrResult<Option<TransactionReceipt>> {
        self.with_failover("eth_getTransactionReceipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }
}

#[async_trait]
impl PublisherBackend for ChainProvider {
    async fn nonce_at(&self, address: Address) -> TxMgrResult<u64> {
        let nonce = self
            .with_failover("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Latest.into()))
                    .await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    async fn suggest_gas_tip_cap(&self) -> TxMgrResult<U256> {
        self.with_failover("eth_maxPriorityFeePerGas", |p| async move {
            p.request::<_, U256>("eth_maxPriorityFeePerGas", ()).await
        })
        .await
    }

    async fn header_by_number(&self, number: Option<u64>) -> TxMgrResult<Block<H256>> {
        let tag = number.map(BlockNumber::from).unwrap_or(BlockNumber::Latest);
        self.with_failover("eth_getBlockByNumber", |p| async move { p.get_block(tag).await })
            .await?
            .ok_or_else(|| TxMgrError::Rpc(format!("block {:?} not found", tag)))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> TxMgrResult<U256> {
        self.with_failover("eth_estimateGas", |p| async move { p.estimate_gas(tx, None).await })
            .await
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> TxMgrResult<()> {
        let raw = tx.raw();
        self.with_failover("eth_sendRawTransaction", |p| {
            let raw = raw.clone();
            async move { p.send_raw_transaction(raw).await.map(|pending| *pending) }
        })
        .await?;
        Ok(())
    }

    async fn balance_at(&self, address: Address) -> TxMgrResult<U256> {
        self.with_failover("eth_getBalance", |p| async move { p.get_balance(address, None).await })
            .await
    }

    async fn call(&self, tx: &TypedTransaction) -> TxMgrResult<Bytes> {
        self.with_failover("eth_call", |p| async move { p.call(tx, None).await })
            .await
    }
}

#[async_trait]
impl LogSource for ChainProvider {
    async fn logs(&self, filter: &Filter) -> TxMgrResult<Vec<Log>> {
        self.with_failover("eth_getLogs", |p| async move { p.get_logs(filter).await })
            .await
    }
}
