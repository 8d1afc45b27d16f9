//! State management with PostgreSQL persistence
//!
//! Handles:
//! - Pending batch transactions for crash recovery
//! - Deposits awaiting disbursement
//! - Disbursement outcomes

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::MemoryStore;

use crate::error::SubmitterResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};

/// A published batch transaction whose outcome has not been recorded yet.
///
/// All fee-bumped variants of one batch share `(start_id, end_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub tx_hash: H256,
    pub start_id: u64,
    /// Exclusive
    pub end_id: u64,
}

/// A deposit observed on L1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub id: u64,
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub address: Address,
    pub amount: U256,
}

/// Outcome of a disbursement as recorded from the L2 receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    pub deposit_id: u64,
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Persistence for published-but-unreconciled transactions
#[async_trait]
pub trait PendingTxStore: Send + Sync {
    /// Insert or replace by `tx_hash`
    async fn upsert_pending_tx(&self, pending_tx: &PendingTx) -> SubmitterResult<()>;

    /// All pending txs ordered by `start_id` desc, `end_id` desc, `tx_hash` asc
    async fn list_pending_txs(&self) -> SubmitterResult<Vec<PendingTx>>;

    /// Removes every pending tx for the batch `[start_id, end_id)`
    async fn delete_pending_txs(&self, start_id: u64, end_id: u64) -> SubmitterResult<()>;
}

/// Deposit and disbursement bookkeeping used by the disburser
#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Deposits with at least `num_confirmations` at `block_number` that have
    /// no recorded disbursement, ordered by id.
    async fn confirmed_deposits(
        &self,
        block_number: u64,
        num_confirmations: u64,
    ) -> SubmitterResult<Vec<Deposit>>;

    /// Insert or replace deposits by id and advance the ingestion cursor to
    /// `last_processed_block`, atomically.
    async fn upsert_deposits(
        &self,
        deposits: &[Deposit],
        last_processed_block: u64,
    ) -> SubmitterResult<()>;

    /// Highest L1 block whose deposits have been ingested
    async fn last_processed_block(&self) -> SubmitterResult<Option<u64>>;

    /// Highest deposit id with a recorded disbursement
    async fn latest_disbursement_id(&self) -> SubmitterResult<Option<u64>>;

    async fn upsert_disbursement(&self, disbursement: &Disbursement) -> SubmitterResult<()>;
}
