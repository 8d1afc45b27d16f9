//! Teleportr disburser driver
//!
//! Pays out L1 deposits on L2 by calling `disburse` on the disburser
//! contract. `EtherReceived` events are ingested from the L1 deposit contract
//! into the database; the contract's `totalDisbursements()` is the next
//! deposit id to pay. Every published variant is recorded as a pending tx
//! first so a restart can reconcile the outcome from the receipt's
//! disbursement events.

use crate::chain::LogSource;
use crate::error::{SubmitterError, SubmitterResult};
use crate::metrics;
use crate::service::Driver;
use crate::state::{Deposit, DepositStore, Disbursement, PendingTx, PendingTxStore};
use crate::tx::current_fees;
use crate::txmgr::{PublisherBackend, ReceiptSource, SignedTransaction, TxMgrError, TxMgrResult};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::{parse_abi, Abi, RawLog, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Eip1559TransactionRequest, Filter, Log, TransactionReceipt, H256, U256,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Topic of `DisbursementSuccess(uint256 indexed depositId, ...)`
pub const DISBURSEMENT_SUCCESS_TOPIC: H256 = H256([
    0xea, 0xa2, 0x2f, 0xd2, 0xd7, 0xb8, 0x75, 0x47, 0x63, 0x55, 0xb3, 0x2c, 0xf7, 0x19, 0x79, 0x4f,
    0xaf, 0x9d, 0x91, 0xb6, 0x6e, 0x73, 0xbc, 0x63, 0x75, 0xa0, 0x53, 0xca, 0xce, 0x9c, 0xaa, 0xee,
]);

/// Topic of `DisbursementFailed(uint256 indexed depositId, ...)`
pub const DISBURSEMENT_FAILED_TOPIC: H256 = H256([
    0x9b, 0x47, 0x8c, 0x09, 0x59, 0x79, 0xd3, 0xd3, 0xa7, 0xd6, 0x02, 0xff, 0xd9, 0xee, 0x1f, 0x08,
    0x43, 0x20, 0x4d, 0x85, 0x35, 0x58, 0xae, 0x08, 0x82, 0xc8, 0xfc, 0xc0, 0xa5, 0xbc, 0x78, 0xcf,
]);

const DISBURSER_ABI: &[&str] = &[
    "struct Disbursement { uint256 amount; address addr; }",
    "function disburse(uint256 _nextDepositId, Disbursement[] _disbursements) payable",
    "function totalDisbursements() view returns (uint256)",
];

const DEPOSIT_ABI: &[&str] = &[
    "event EtherReceived(uint256 indexed depositId, address indexed emitter, uint256 indexed amount)",
];

#[derive(Debug, Clone)]
pub struct DisburserDriverConfig {
    pub name: String,
    /// L1 confirmations a deposit needs before it is paid out
    pub num_confirmations: u64,
    pub disburser_address: Address,
    /// L1 deposit contract emitting `EtherReceived`
    pub deposit_address: Address,
    /// First L1 block scanned when nothing has been ingested yet
    pub deploy_block_number: u64,
    /// Maximum number of blocks covered by one log query
    pub filter_query_max_blocks: u64,
}

pub struct DisburserDriver<L2, L1, S> {
    config: DisburserDriverConfig,
    l2: Arc<L2>,
    l1: Arc<L1>,
    store: Arc<S>,
    wallet: LocalWallet,
    abi: Abi,
    deposit_abi: Abi,
    /// Deposit ids carried by the most recently crafted batch
    current_deposit_ids: Mutex<Vec<u64>>,
}

impl<L2, L1, S> DisburserDriver<L2, L1, S>
where
    L2: PublisherBackend,
    L1: PublisherBackend + LogSource,
    S: PendingTxStore + DepositStore,
{
    pub fn new(
        config: DisburserDriverConfig,
        l2: Arc<L2>,
        l1: Arc<L1>,
        store: Arc<S>,
        wallet: LocalWallet,
    ) -> SubmitterResult<Self> {
        if config.num_confirmations == 0 {
            return Err(SubmitterError::Config(
                "num_confirmations cannot be zero".to_string(),
            ));
        }
        if config.filter_query_max_blocks == 0 {
            return Err(SubmitterError::Config(
                "filter_query_max_blocks cannot be zero".to_string(),
            ));
        }
        let abi = parse_abi(DISBURSER_ABI)
            .map_err(|e| SubmitterError::Contract(format!("invalid disburser abi: {}", e)))?;
        let deposit_abi = parse_abi(DEPOSIT_ABI)
            .map_err(|e| SubmitterError::Contract(format!("invalid deposit abi: {}", e)))?;

        Ok(Self {
            config,
            l2,
            l1,
            store,
            wallet,
            abi,
            deposit_abi,
            current_deposit_ids: Mutex::new(Vec::new()),
        })
    }

    /// Next deposit id the contract will disburse
    pub async fn total_disbursements(&self) -> SubmitterResult<u64> {
        let data = self
            .abi
            .function("totalDisbursements")
            .and_then(|f| f.encode_input(&[]))
            .map_err(|e| SubmitterError::Contract(e.to_string()))?;
        let call: TypedTransaction = Eip1559TransactionRequest::new()
            .to(self.config.disburser_address)
            .data(data)
            .into();

        let output = self.l2.call(&call).await?;
        let tokens = self
            .abi
            .function("totalDisbursements")
            .and_then(|f| f.decode_output(&output))
            .map_err(|e| SubmitterError::Contract(e.to_string()))?;

        tokens
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .map(|id| id.low_u64())
            .ok_or_else(|| SubmitterError::Contract("totalDisbursements returned no value".to_string()))
    }

    /// Records the outcome of published disbursements. Handles both restart
    /// recovery and post-processing of a freshly confirmed batch.
    pub async fn process_pending_txs(&self) -> SubmitterResult<()> {
        let name = self.config.name.as_str();
        let pending_txs = self.list_pending_txs().await?;
        if pending_txs.is_empty() {
            return Ok(());
        }

        // At most one variant can have confirmed successfully.
        let mut confirmed = None;
        for pending_tx in &pending_txs {
            match self.l2.transaction_receipt(pending_tx.tx_hash).await? {
                Some(receipt) if receipt.status == Some(1u64.into()) => {
                    confirmed = Some((pending_tx, receipt));
                    break;
                }
                _ => continue,
            }
        }
        let Some((pending_tx, receipt)) = confirmed else {
            return Err(SubmitterError::Driver(
                "unable to find receipt for any pending tx".to_string(),
            ));
        };

        let block_number = receipt
            .block_number
            .ok_or_else(|| SubmitterError::Driver("receipt has no block number".to_string()))?
            .as_u64();
        let header = self.l2.header_by_number(Some(block_number)).await?;
        let block_timestamp = block_time(header.timestamp)?;

        let mut successful = 0;
        let mut failed = 0;
        let mut failed_upserts = 0;
        for log in &receipt.logs {
            let success = match log.topics.first() {
                Some(topic) if *topic == DISBURSEMENT_SUCCESS_TOPIC => true,
                Some(topic) if *topic == DISBURSEMENT_FAILED_TOPIC => false,
                _ => continue,
            };
            let Some(id_topic) = log.topics.get(1) else {
                warn!("{} disbursement event without deposit id in {:?}", name, receipt.transaction_hash);
                continue;
            };
            let deposit_id = U256::from_big_endian(id_topic.as_bytes()).low_u64();
            if success {
                successful += 1;
            } else {
                failed += 1;
            }

            let disbursement = Disbursement {
                deposit_id,
                tx_hash: receipt.transaction_hash,
                block_number,
                block_timestamp,
                success,
            };
            match self.store.upsert_disbursement(&disbursement).await {
                Ok(()) => info!(
                    "{} disbursement {} recorded (success: {}, tx {:?}, block {})",
                    name, deposit_id, success, receipt.transaction_hash, block_number
                ),
                Err(e) => {
                    failed_upserts += 1;
                    metrics::record_database_failure(name, "upsert_disbursement");
                    warn!("{} unable to record disbursement {}: {}", name, deposit_id, e);
                }
            }
        }
        metrics::record_disbursements(name, successful, failed);

        if failed_upserts > 0 {
            return Err(SubmitterError::Driver(format!(
                "failed to record {} disbursements",
                failed_upserts
            )));
        }

        self.store
            .delete_pending_txs(pending_tx.start_id, pending_tx.end_id)
            .await
            .map_err(|e| {
                metrics::record_database_failure(name, "delete_pending_txs");
                e
            })?;

        // Leftovers belong to another batch; surface them so the next poll
        // reconciles them before crafting anything new.
        if !self.list_pending_txs().await?.is_empty() {
            return Err(SubmitterError::Driver(
                "pending txs remain in database".to_string(),
            ));
        }

        Ok(())
    }

    /// Scans the deposit contract's `EtherReceived` events up to
    /// `block_number` and stores them as deposits. Each window is committed
    /// together with its last block, so an interrupted scan resumes after the
    /// last committed window.
    pub async fn ingest_deposits(
        &self,
        block_number: u64,
        last_processed_block: Option<u64>,
    ) -> SubmitterResult<()> {
        let name = self.config.name.as_str();
        let event = self
            .deposit_abi
            .event("EtherReceived")
            .map_err(|e| SubmitterError::Contract(e.to_string()))?;

        let max_blocks = self.config.filter_query_max_blocks;
        let mut start = filter_start_block(
            block_number,
            self.config.num_confirmations,
            self.config.deploy_block_number,
            last_processed_block,
        );
        let mut timestamps = HashMap::new();
        while start <= block_number {
            let end = start.saturating_add(max_blocks - 1).min(block_number);
            let filter = Filter::new()
                .address(self.config.deposit_address)
                .topic0(event.signature())
                .from_block(start)
                .to_block(end);
            let logs = self.l1.logs(&filter).await?;

            let mut deposits = Vec::with_capacity(logs.len());
            for log in logs {
                let deposit = self.decode_deposit(event, log, &mut timestamps).await?;
                deposits.push(deposit);
            }
            if !deposits.is_empty() {
                info!(
                    "{} ingested {} deposits in blocks [{}, {}]",
                    name,
                    deposits.len(),
                    start,
                    end
                );
            }

            self.store
                .upsert_deposits(&deposits, end)
                .await
                .map_err(|e| {
                    metrics::record_database_failure(name, "upsert_deposits");
                    e
                })?;

            if end >= block_number {
                break;
            }
            start = end + 1;
        }

        Ok(())
    }

    async fn decode_deposit(
        &self,
        event: &ethers::abi::Event,
        log: Log,
        timestamps: &mut HashMap<u64, DateTime<Utc>>,
    ) -> SubmitterResult<Deposit> {
        let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number) else {
            return Err(SubmitterError::Driver(
                "deposit event without transaction or block".to_string(),
            ));
        };
        let block_number = block_number.as_u64();

        let parsed = event
            .parse_log(RawLog {
                topics: log.topics,
                data: log.data.to_vec(),
            })
            .map_err(|e| SubmitterError::Contract(format!("invalid deposit event: {}", e)))?;
        let mut params = parsed.params.into_iter().map(|p| p.value);
        let (Some(id), Some(address), Some(amount)) = (
            params.next().and_then(Token::into_uint),
            params.next().and_then(Token::into_address),
            params.next().and_then(Token::into_uint),
        ) else {
            return Err(SubmitterError::Contract(format!(
                "malformed deposit event in {:?}",
                tx_hash
            )));
        };

        let block_timestamp = match timestamps.get(&block_number) {
            Some(timestamp) => *timestamp,
            None => {
                let header = self.l1.header_by_number(Some(block_number)).await?;
                let timestamp = block_time(header.timestamp)?;
                timestamps.insert(block_number, timestamp);
                timestamp
            }
        };

        Ok(Deposit {
            id: id.low_u64(),
            tx_hash,
            block_number,
            block_timestamp,
            address,
            amount,
        })
    }

    async fn update_balance_metrics(&self) {
        let name = self.config.name.as_str();
        match self.l1.balance_at(self.config.deposit_address).await {
            Ok(balance) => match ethers::utils::format_ether(balance).parse::<f64>() {
                Ok(eth) => metrics::record_deposit_contract_balance(name, eth),
                Err(e) => warn!("{} unable to convert deposit balance {}: {}", name, balance, e),
            },
            Err(e) => error!("{} unable to fetch deposit contract balance: {}", name, e),
        }
    }

    /// Confirmed deposits with ids in `[start_id, end_id)`, which must be
    /// contiguous from `start_id`.
    pub async fn load_confirmed_deposits_in_range(
        &self,
        block_number: u64,
        start_id: u64,
        end_id: u64,
    ) -> SubmitterResult<Vec<Deposit>> {
        let name = self.config.name.as_str();
        let confirmed = self
            .store
            .confirmed_deposits(block_number, self.config.num_confirmations)
            .await
            .map_err(|e| {
                metrics::record_database_failure(name, "confirmed_deposits");
                e
            })?;

        let mut missing_disbursements = 0;
        let mut deposits = Vec::with_capacity(confirmed.len());
        for deposit in confirmed {
            if deposit.id < start_id {
                // The contract paid this deposit but the outcome was never recorded.
                warn!("{} filtering deposit {} with missing disbursement", name, deposit.id);
                missing_disbursements += 1;
                continue;
            }
            if deposit.id >= end_id {
                continue;
            }
            deposits.push(deposit);
        }
        metrics::record_missing_disbursements(name, missing_disbursements);

        let (Some(first), Some(last)) = (deposits.first(), deposits.last()) else {
            return Ok(deposits);
        };
        if first.id != start_id {
            return Err(SubmitterError::Driver(format!(
                "confirmed deposits start at {}, contract expects {}",
                first.id, start_id
            )));
        }
        if start_id + deposits.len() as u64 != last.id + 1 {
            return Err(SubmitterError::Driver(format!(
                "confirmed deposits [{}, {}] are not contiguous",
                first.id, last.id
            )));
        }

        Ok(deposits)
    }

    /// Compares the last recorded disbursement with the contract. Falling
    /// behind is reported; being ahead means lost contract state and is fatal.
    fn check_database_contract_mismatch(
        &self,
        last_disbursement_id: Option<u64>,
        contract_next_id: u64,
    ) -> SubmitterResult<()> {
        let name = self.config.name.as_str();
        match last_disbursement_id {
            Some(last) if last + 1 < contract_next_id => {
                warn!(
                    "{} recorded disbursements behind contract (last {}, contract next {})",
                    name, last, contract_next_id
                );
                metrics::record_deposit_id_mismatch(name, true);
            }
            Some(last) if last + 1 > contract_next_id => {
                error!(
                    "{} recorded disbursements ahead of contract (last {}, contract next {})",
                    name, last, contract_next_id
                );
                return Err(SubmitterError::Driver(format!(
                    "recorded disbursement {} is ahead of contract next id {}",
                    last, contract_next_id
                )));
            }
            None if contract_next_id != 0 => {
                warn!(
                    "{} no recorded disbursements, contract next id is {}",
                    name, contract_next_id
                );
                metrics::record_deposit_id_mismatch(name, true);
            }
            _ => metrics::record_deposit_id_mismatch(name, false),
        }
        Ok(())
    }

    async fn list_pending_txs(&self) -> SubmitterResult<Vec<PendingTx>> {
        self.store
            .list_pending_txs()
            .await
            .map_err(|e| {
                metrics::record_database_failure(&self.config.name, "list_pending_txs");
                e
            })
    }
}

#[async_trait]
impl<L2, L1, S> Driver for DisburserDriver<L2, L1, S>
where
    L2: PublisherBackend,
    L1: PublisherBackend + LogSource,
    S: PendingTxStore + DepositStore,
{
    fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    async fn get_batch_block_range(&self) -> SubmitterResult<(u64, u64)> {
        let name = self.config.name.as_str();
        self.update_balance_metrics().await;
        self.current_deposit_ids.lock().await.clear();

        self.process_pending_txs().await?;

        let last_disbursement_id = self
            .store
            .latest_disbursement_id()
            .await
            .map_err(|e| {
                metrics::record_database_failure(name, "latest_disbursement_id");
                e
            })?;
        if let Some(id) = last_disbursement_id {
            metrics::record_last_disbursed_id(name, id);
        }

        let start_id = self.total_disbursements().await?;
        metrics::record_contract_next_disbursement_id(name, start_id);
        self.check_database_contract_mismatch(last_disbursement_id, start_id)?;

        let block_number = self.l1.block_number().await?;
        let last_processed_block = self
            .store
            .last_processed_block()
            .await
            .map_err(|e| {
                metrics::record_database_failure(name, "last_processed_block");
                e
            })?;
        self.ingest_deposits(block_number, last_processed_block).await?;

        let deposits = self
            .load_confirmed_deposits_in_range(block_number, start_id, u64::MAX)
            .await?;

        match deposits.last() {
            Some(last) => Ok((start_id, last.id + 1)),
            None => Ok((start_id, start_id)),
        }
    }

    async fn craft_batch_tx(
        &self,
        start: u64,
        end: u64,
        nonce: u64,
    ) -> SubmitterResult<Option<TypedTransaction>> {
        let name = self.config.name.as_str();
        let block_number = self.l1.block_number().await?;
        let deposits = self
            .load_confirmed_deposits_in_range(block_number, start, end)
            .await?;
        if deposits.is_empty() {
            warn!("{} no confirmed deposits in [{}, {})", name, start, end);
            return Ok(None);
        }

        let mut value = U256::zero();
        let mut disbursements = Vec::with_capacity(deposits.len());
        for deposit in &deposits {
            value = value.checked_add(deposit.amount).ok_or_else(|| {
                SubmitterError::Driver(format!(
                    "disbursement value overflows at deposit {}",
                    deposit.id
                ))
            })?;
            disbursements.push(Token::Tuple(vec![
                Token::Uint(deposit.amount),
                Token::Address(deposit.address),
            ]));
        }

        info!(
            "{} crafting batch tx (start {}, end {}, nonce {}, disbursements {})",
            name,
            start,
            end,
            nonce,
            deposits.len()
        );
        metrics::record_num_elements(name, deposits.len());

        let data = self
            .abi
            .function("disburse")
            .and_then(|f| f.encode_input(&[Token::Uint(U256::from(start)), Token::Array(disbursements)]))
            .map_err(|e| SubmitterError::Contract(e.to_string()))?;

        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.config.disburser_address)
            .nonce(nonce)
            .value(value)
            .data(data)
            .chain_id(self.wallet.chain_id())
            .into();

        *self.current_deposit_ids.lock().await = deposits.iter().map(|d| d.id).collect();

        Ok(Some(tx))
    }

    async fn update_gas_price(
        &self,
        cancel: CancellationToken,
        mut tx: TypedTransaction,
    ) -> TxMgrResult<SignedTransaction> {
        if cancel.is_cancelled() {
            return Err(TxMgrError::Canceled);
        }

        let (gas_tip_cap, gas_fee_cap) = current_fees(self.l2.as_ref()).await?;
        match &mut tx {
            TypedTransaction::Eip1559(inner) => {
                inner.max_priority_fee_per_gas = Some(gas_tip_cap);
                inner.max_fee_per_gas = Some(gas_fee_cap);
            }
            other => {
                other.set_gas_price(gas_fee_cap);
            }
        }

        let gas_limit = self.l2.estimate_gas(&tx).await?;
        tx.set_gas(gas_limit);

        SignedTransaction::sign(tx, &self.wallet)
    }

    async fn send_transaction(
        &self,
        _cancel: CancellationToken,
        tx: SignedTransaction,
    ) -> TxMgrResult<()> {
        let (start_id, end_id) = {
            let ids = self.current_deposit_ids.lock().await;
            match (ids.first(), ids.last()) {
                (Some(first), Some(last)) => (*first, last + 1),
                _ => {
                    return Err(TxMgrError::Config(
                        "no crafted batch to publish".to_string(),
                    ))
                }
            }
        };

        // Recorded before publishing so a crash cannot lose the hash.
        let pending_tx = PendingTx {
            tx_hash: tx.hash(),
            start_id,
            end_id,
        };
        if let Err(e) = self.store.upsert_pending_tx(&pending_tx).await {
            metrics::record_database_failure(&self.config.name, "upsert_pending_tx");
            return Err(TxMgrError::Rpc(format!("unable to record pending tx: {}", e)));
        }

        self.l2.send_transaction(&tx).await
    }

    async fn process_receipt(&self, _receipt: &TransactionReceipt) -> SubmitterResult<()> {
        self.process_pending_txs().await
    }
}

/// First L1 block to scan. A fresh database starts at the deploy block.
/// Otherwise scanning resumes after the last processed block, pulled back so
/// blocks still short of `num_confirmations` are scanned again.
fn filter_start_block(
    block_number: u64,
    num_confirmations: u64,
    deploy_block_number: u64,
    last_processed_block: Option<u64>,
) -> u64 {
    let Some(last) = last_processed_block else {
        return deploy_block_number;
    };
    let unconfirmed_from = (block_number + 1).saturating_sub(num_confirmations);
    (last + 1).min(unconfirmed_from).max(deploy_block_number)
}

fn block_time(timestamp: U256) -> SubmitterResult<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp.low_u64() as i64, 0)
        .single()
        .ok_or_else(|| SubmitterError::Driver(format!("invalid block timestamp {}", timestamp)))
}
