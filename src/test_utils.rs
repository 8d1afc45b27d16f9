//! Shared fixtures for unit tests: a scripted chain backend and fee schedules.

use crate::chain::LogSource;
use crate::tx::gas::calc_gas_fee_cap;
use crate::txmgr::{
    PublisherBackend, ReceiptSource, SignedTransaction, TxMgrError, TxMgrResult,
    MAX_PRIORITY_FEE_NOT_FOUND,
};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Block, Bytes, Eip1559TransactionRequest, Filter, Log, TransactionReceipt, H256,
    U256, U64,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Well-known anvil development key #0
const TEST_PRIVATE_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn test_wallet() -> LocalWallet {
    TEST_PRIVATE_KEY
        .parse::<LocalWallet>()
        .expect("valid test key")
        .with_chain_id(1u64)
}

/// Unsigned dynamic fee transaction with the given caps.
pub fn dynamic_fee_tx(gas_tip_cap: u64, gas_fee_cap: u64) -> TypedTransaction {
    Eip1559TransactionRequest::new()
        .to(Address::zero())
        .nonce(0u64)
        .gas(21_000u64)
        .value(0u64)
        .max_priority_fee_per_gas(gas_tip_cap)
        .max_fee_per_gas(gas_fee_cap)
        .chain_id(1u64)
        .into()
}

/// Epoch based fee schedule. Every sample moves one epoch forward, scaling the
/// base tip and base fee linearly.
pub struct GasPricer {
    mine_at_epoch: u64,
    base_gas_tip_fee: U256,
    base_base_fee: U256,
    epoch: AtomicU64,
}

impl GasPricer {
    pub fn new(mine_at_epoch: u64) -> Self {
        Self {
            mine_at_epoch,
            base_gas_tip_fee: U256::from(5),
            base_base_fee: U256::from(7),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn fees_for_epoch(&self, epoch: u64) -> (U256, U256) {
        let base_fee = self.base_base_fee * epoch;
        let gas_tip_cap = self.base_gas_tip_fee * epoch;
        (gas_tip_cap, calc_gas_fee_cap(base_fee, gas_tip_cap))
    }

    /// Fee cap of the variant that is meant to be mined
    pub fn exp_gas_fee_cap(&self) -> U256 {
        self.fees_for_epoch(self.mine_at_epoch).1
    }

    pub fn should_mine(&self, gas_fee_cap: U256) -> bool {
        gas_fee_cap == self.exp_gas_fee_cap()
    }

    /// Advances one epoch and returns its `(gas_tip_cap, gas_fee_cap)`.
    pub fn sample(&self) -> (U256, U256) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.fees_for_epoch(epoch)
    }
}

#[derive(Debug, Clone)]
struct MinedTx {
    gas_fee_cap: U256,
    block_number: u64,
    reverted: bool,
}

#[derive(Debug, Clone)]
enum TipCap {
    Value(U256),
    Unsupported,
    Failing(String),
}

/// What `send_transaction` does with a published transaction
#[derive(Debug, Clone)]
pub enum SendBehavior {
    /// Accept into the mempool, never mine.
    Accept,
    /// Mine in a fresh block.
    Mine,
    /// Reject with the given backend message.
    Fail(String),
}

#[derive(Debug)]
struct ChainState {
    block_height: u64,
    mined_txs: HashMap<H256, MinedTx>,
    receipts: HashMap<H256, TransactionReceipt>,
    nonce: u64,
    tip_cap: TipCap,
    base_fee: Option<U256>,
    gas_estimate: U256,
    send_behavior: SendBehavior,
    queued_failures: VecDeque<String>,
    sent: Vec<SignedTransaction>,
    call_result: Bytes,
    balance: U256,
    block_timestamp: u64,
    logs: Vec<Log>,
    log_queries: Vec<(u64, u64)>,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            block_height: 0,
            mined_txs: HashMap::new(),
            receipts: HashMap::new(),
            nonce: 0,
            tip_cap: TipCap::Value(U256::from(5)),
            base_fee: Some(U256::from(7)),
            gas_estimate: U256::from(21_000),
            send_behavior: SendBehavior::Accept,
            queued_failures: VecDeque::new(),
            sent: Vec::new(),
            call_result: Bytes::default(),
            balance: U256::zero(),
            block_timestamp: 1_650_000_000,
            logs: Vec::new(),
            log_queries: Vec::new(),
        }
    }
}

/// In-memory chain that mines on request. Receipts carry the mined tx's fee
/// cap in `gas_used` so tests can tell which variant confirmed.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<ChainState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    /// Mines a new block, optionally including `tx_hash`.
    pub fn mine(&self, tx_hash: Option<H256>, gas_fee_cap: U256) {
        self.mine_with_status(tx_hash, gas_fee_cap, false);
    }

    pub fn mine_with_status(&self, tx_hash: Option<H256>, gas_fee_cap: U256, reverted: bool) {
        let mut state = self.state();
        state.block_height += 1;
        if let Some(tx_hash) = tx_hash {
            let block_number = state.block_height;
            state.mined_txs.insert(
                tx_hash,
                MinedTx {
                    gas_fee_cap,
                    block_number,
                    reverted,
                },
            );
        }
    }

    /// Removes `tx_hash` from the chain.
    pub fn reorg(&self, tx_hash: H256) {
        self.state().mined_txs.remove(&tx_hash);
    }

    /// Registers a fully specified receipt, taking precedence over mined txs.
    pub fn insert_receipt(&self, receipt: TransactionReceipt) {
        self.state().receipts.insert(receipt.transaction_hash, receipt);
    }

    pub fn set_block_height(&self, height: u64) {
        self.state().block_height = height;
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.state().nonce = nonce;
    }

    pub fn set_gas_tip_cap(&self, tip: U256) {
        self.state().tip_cap = TipCap::Value(tip);
    }

    pub fn set_tip_cap_unsupported(&self) {
        self.state().tip_cap = TipCap::Unsupported;
    }

    pub fn set_tip_cap_error(&self, message: &str) {
        self.state().tip_cap = TipCap::Failing(message.to_string());
    }

    pub fn set_base_fee(&self, base_fee: Option<U256>) {
        self.state().base_fee = base_fee;
    }

    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        self.state().send_behavior = behavior;
    }

    /// Fails the next publish with `message`, ahead of the send behavior. A
    /// nonce-too-low failure also advances the account nonce, as if another
    /// transaction had taken the slot.
    pub fn queue_send_failure(&self, message: &str) {
        self.state().queued_failures.push_back(message.to_string());
    }

    pub fn set_call_result(&self, result: Bytes) {
        self.state().call_result = result;
    }

    pub fn set_balance(&self, balance: U256) {
        self.state().balance = balance;
    }

    pub fn block_timestamp(&self) -> u64 {
        self.state().block_timestamp
    }

    /// Adds an event log served by `logs` when its block is in range.
    pub fn push_log(&self, log: Log) {
        self.state().logs.push(log);
    }

    /// Inclusive `(from, to)` block ranges of every log query, in order
    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state().log_queries.clone()
    }

    /// Every transaction handed to `send_transaction`, in order
    pub fn sent(&self) -> Vec<SignedTransaction> {
        self.state().sent.clone()
    }
}

#[async_trait]
impl ReceiptSource for MockBackend {
    async fn block_number(&self) -> TxMgrResult<u64> {
        Ok(self.state().block_height)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> TxMgrResult<Option<TransactionReceipt>> {
        let state = self.state();
        if let Some(receipt) = state.receipts.get(&tx_hash) {
            return Ok(Some(receipt.clone()));
        }
        Ok(state.mined_txs.get(&tx_hash).map(|mined| TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(mined.block_number)),
            gas_used: Some(mined.gas_fee_cap),
            status: Some(U64::from(if mined.reverted { 0u64 } else { 1u64 })),
            ..Default::default()
        }))
    }
}

#[async_trait]
impl PublisherBackend for MockBackend {
    async fn nonce_at(&self, _address: Address) -> TxMgrResult<u64> {
        Ok(self.state().nonce)
    }

    async fn suggest_gas_tip_cap(&self) -> TxMgrResult<U256> {
        match &self.state().tip_cap {
            TipCap::Value(tip) => Ok(*tip),
            TipCap::Unsupported => Err(TxMgrError::Rpc(format!(
                "(code: -32601, message: {}, data: None)",
                MAX_PRIORITY_FEE_NOT_FOUND
            ))),
            TipCap::Failing(message) => Err(TxMgrError::Rpc(message.clone())),
        }
    }

    async fn header_by_number(&self, number: Option<u64>) -> TxMgrResult<Block<H256>> {
        let state = self.state();
        let number = number.unwrap_or(state.block_height);
        Ok(Block {
            number: Some(U64::from(number)),
            base_fee_per_gas: state.base_fee,
            timestamp: U256::from(state.block_timestamp),
            ..Default::default()
        })
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> TxMgrResult<U256> {
        Ok(self.state().gas_estimate)
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> TxMgrResult<()> {
        let behavior = {
            let mut state = self.state();
            state.sent.push(tx.clone());
            match state.queued_failures.pop_front() {
                Some(message) => {
                    if TxMgrError::from_rpc_error(message.clone()).is_nonce_too_low() {
                        state.nonce += 1;
                    }
                    SendBehavior::Fail(message)
                }
                None => state.send_behavior.clone(),
            }
        };
        match behavior {
            SendBehavior::Accept => Ok(()),
            SendBehavior::Mine => {
                self.mine(Some(tx.hash()), tx.gas_fee_cap().unwrap_or_default());
                Ok(())
            }
            SendBehavior::Fail(message) => Err(TxMgrError::from_rpc_error(message)),
        }
    }

    async fn balance_at(&self, _address: Address) -> TxMgrResult<U256> {
        Ok(self.state().balance)
    }

    async fn call(&self, _tx: &TypedTransaction) -> TxMgrResult<Bytes> {
        Ok(self.state().call_result.clone())
    }
}

#[async_trait]
impl LogSource for MockBackend {
    async fn logs(&self, filter: &Filter) -> TxMgrResult<Vec<Log>> {
        let mut state = self.state();
        let from = filter.get_from_block().map(|b| b.as_u64()).unwrap_or_default();
        let to = filter
            .get_to_block()
            .map(|b| b.as_u64())
            .unwrap_or(state.block_height);
        state.log_queries.push((from, to));
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .map(|n| (from..=to).contains(&n.as_u64()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// Fails the first receipt lookup and the first tip query, then reports every
/// hash as mined in block 1.
#[derive(Debug, Default)]
pub struct FailingBackend {
    returned_first_receipt: AtomicBool,
    returned_first_block_number: AtomicBool,
}

#[async_trait]
impl ReceiptSource for FailingBackend {
    async fn block_number(&self) -> TxMgrResult<u64> {
        if !self.returned_first_block_number.swap(true, Ordering::SeqCst) {
            return Err(TxMgrError::Rpc("failed to fetch block number".to_string()));
        }
        Ok(1)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> TxMgrResult<Option<TransactionReceipt>> {
        if !self.returned_first_receipt.swap(true, Ordering::SeqCst) {
            return Err(TxMgrError::Rpc("failed to fetch receipt".to_string()));
        }
        Ok(Some(TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::one()),
            status: Some(U64::one()),
            ..Default::default()
        }))
    }
}
