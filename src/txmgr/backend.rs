//! Minimal chain interfaces consumed by the transaction manager

use super::error::TxMgrResult;
use super::transaction::SignedTransaction;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Block, Bytes, TransactionReceipt, H256, U256};

/// Source of receipts and chain height used to track confirmations.
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    /// Current height of the chain tip.
    async fn block_number(&self) -> TxMgrResult<u64>;

    /// Receipt for `tx_hash`. A lookup that succeeds but finds no
    /// transaction must return `Ok(None)`.
    async fn transaction_receipt(&self, tx_hash: H256) -> TxMgrResult<Option<TransactionReceipt>>;
}

/// Full backend needed to craft, price and publish transactions.
#[async_trait]
pub trait PublisherBackend: ReceiptSource {
    /// Account nonce at the latest block.
    async fn nonce_at(&self, address: Address) -> TxMgrResult<u64>;

    /// Suggested priority fee. Backends without `eth_maxPriorityFeePerGas`
    /// return an error for which `is_max_priority_fee_not_found` holds.
    async fn suggest_gas_tip_cap(&self) -> TxMgrResult<U256>;

    /// Header at `number`, or the latest header when `None`.
    async fn header_by_number(&self, number: Option<u64>) -> TxMgrResult<Block<H256>>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> TxMgrResult<U256>;

    /// Publishes a signed transaction to the mempool.
    async fn send_transaction(&self, tx: &SignedTransaction) -> TxMgrResult<()>;

    async fn balance_at(&self, address: Address) -> TxMgrResult<U256>;

    /// Executes a read-only call against the latest state.
    async fn call(&self, tx: &TypedTransaction) -> TxMgrResult<Bytes>;
}
