//! Periodic batch submission
//!
//! The [`BatchSubmitter`] polls a [`Driver`] for work, crafts one batch
//! transaction per tick and hands it to the transaction manager. On startup it
//! optionally clears any transaction a previous instance left in the mempool.

use crate::error::{SubmitterError, SubmitterResult};
use crate::metrics;
use crate::tx::clear_pending_tx;
use crate::txmgr::{PublisherBackend, SignedTransaction, TxManager, TxMgrError, TxMgrResult};

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Application specific half of a batch submitter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Wallet paying for batch transactions
    fn wallet_address(&self) -> Address;

    /// Returns `(start, end)` of the next batch, `end` exclusive. An empty
    /// range means there is nothing to submit.
    async fn get_batch_block_range(&self) -> SubmitterResult<(u64, u64)>;

    /// Builds the unsigned batch transaction for `[start, end)` at `nonce`.
    /// `None` skips this tick. Must not publish.
    async fn craft_batch_tx(
        &self,
        start: u64,
        end: u64,
        nonce: u64,
    ) -> SubmitterResult<Option<TypedTransaction>>;

    /// Reprices and signs `tx` at current market fees. Must not publish.
    async fn update_gas_price(
        &self,
        cancel: CancellationToken,
        tx: TypedTransaction,
    ) -> TxMgrResult<SignedTransaction>;

    /// Publishes a signed batch transaction.
    async fn send_transaction(
        &self,
        cancel: CancellationToken,
        tx: SignedTransaction,
    ) -> TxMgrResult<()>;

    /// Post-processing of a confirmed, successful batch transaction.
    async fn process_receipt(&self, receipt: &TransactionReceipt) -> SubmitterResult<()>;
}

/// Service loop settings
#[derive(Debug, Clone)]
pub struct BatchSubmitterConfig {
    pub name: String,
    pub poll_interval: Duration,
    pub clear_pending_txs: bool,
    pub clear_pending_timeout: Duration,
}

/// Result of a single poll
#[derive(Debug)]
pub enum BatchOutcome {
    /// The driver reported an empty range
    Idle,
    /// The driver declined to craft a transaction
    Skipped,
    Confirmed(Box<TransactionReceipt>),
    Reverted(Box<TransactionReceipt>),
}

pub struct BatchSubmitter<D, B> {
    config: BatchSubmitterConfig,
    driver: Arc<D>,
    txmgr: TxManager<B>,
    wallet: LocalWallet,
}

impl<D, B> BatchSubmitter<D, B>
where
    D: Driver,
    B: PublisherBackend,
{
    pub fn new(
        config: BatchSubmitterConfig,
        driver: Arc<D>,
        txmgr: TxManager<B>,
        wallet: LocalWallet,
    ) -> Self {
        Self {
            config,
            driver,
            txmgr,
            wallet,
        }
    }

    /// Runs until `cancel` fires. An in-flight submission is always awaited,
    /// so the loop exits only once its workers have stopped.
    pub async fn run(&self, cancel: CancellationToken) -> SubmitterResult<()> {
        let name = self.config.name.as_str();
        info!("Starting {} batch submitter", name);

        if self.config.clear_pending_txs {
            match self.clear_pending_txs(&cancel).await {
                Ok(()) => {}
                Err(e) if e.is_canceled() => {
                    info!("{} stopped during clearing", name);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.submit_batch(&cancel).await {
                Ok(outcome) => debug!("{} poll finished: {:?}", name, outcome),
                Err(e) if e.is_canceled() && cancel.is_cancelled() => break,
                Err(e) if e.is_retryable() => warn!("{} unable to submit batch, retrying next poll: {}", name, e),
                Err(e) => error!("{} unable to submit batch: {}", name, e),
            }
        }

        info!("{} batch submitter stopped", name);
        Ok(())
    }

    /// Publishes clearing transactions until one confirms or shutdown.
    pub async fn clear_pending_txs(&self, cancel: &CancellationToken) -> SubmitterResult<()> {
        let name = self.config.name.as_str();
        loop {
            match clear_pending_tx(cancel, &self.txmgr, &self.wallet, self.config.clear_pending_timeout)
                .await
            {
                Ok(_) => {
                    metrics::record_clearing_attempt(name, "confirmed");
                    return Ok(());
                }
                // Never reuse the nonce that just confirmed.
                Err(SubmitterError::ClearPendingRetry) => {
                    metrics::record_clearing_attempt(name, "retry");
                    info!("{} prior tx confirmed, retrying clearing with next nonce", name);
                }
                Err(e) if e.is_canceled() => return Err(SubmitterError::Canceled),
                Err(e) => {
                    let outcome = match e {
                        SubmitterError::ClearPendingTimeout => "timeout",
                        _ => "error",
                    };
                    metrics::record_clearing_attempt(name, outcome);
                    warn!("{} unable to clear pending txs: {}", name, e);

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SubmitterError::Canceled),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// One poll: fetch a range, craft, publish and post-process.
    pub async fn submit_batch(&self, cancel: &CancellationToken) -> SubmitterResult<BatchOutcome> {
        let name = self.config.name.as_str();
        self.update_balance_metric().await;

        let (start, end) = self.driver.get_batch_block_range().await?;
        if start == end {
            debug!("{} no batch to submit at {}", name, start);
            return Ok(BatchOutcome::Idle);
        }
        if start > end {
            return Err(SubmitterError::Driver(format!(
                "invalid range: start {} is after end {}",
                start, end
            )));
        }

        let nonce = self
            .txmgr
            .backend()
            .nonce_at(self.driver.wallet_address())
            .await?;

        let Some(tx) = self.driver.craft_batch_tx(start, end, nonce).await? else {
            debug!("{} driver skipped batch [{}, {})", name, start, end);
            return Ok(BatchOutcome::Skipped);
        };
        let batch_size = tx.data().map(|data| data.len()).unwrap_or_default();
        metrics::record_batch_size(name, batch_size);
        info!(
            "{} submitting batch [{}, {}) at nonce {} ({} bytes)",
            name, start, end, nonce, batch_size
        );

        let driver: &D = self.driver.as_ref();
        let update_gas_price =
            move |cancel: CancellationToken| driver.update_gas_price(cancel, tx.clone());
        let send_tx =
            move |cancel: CancellationToken, signed: SignedTransaction| driver.send_transaction(cancel, signed);

        let started = Instant::now();
        match self.txmgr.send(cancel, update_gas_price, send_tx).await {
            Ok(receipt) => {
                let gas_used = receipt.gas_used.unwrap_or_default();
                info!(
                    "{} batch [{}, {}) confirmed in tx {:?} (block {:?}, gas used {})",
                    name, start, end, receipt.transaction_hash, receipt.block_number, gas_used
                );
                metrics::record_batch_confirmed(
                    name,
                    gas_used.low_u128() as f64,
                    started.elapsed().as_secs_f64(),
                );
                self.driver.process_receipt(&receipt).await?;
                Ok(BatchOutcome::Confirmed(Box::new(receipt)))
            }
            Err(TxMgrError::Reverted(receipt)) => {
                warn!(
                    "{} batch [{}, {}) reverted in tx {:?}",
                    name, start, end, receipt.transaction_hash
                );
                metrics::record_batch_reverted(name);
                Ok(BatchOutcome::Reverted(receipt))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_balance_metric(&self) {
        let address = self.driver.wallet_address();
        match self.txmgr.backend().balance_at(address).await {
            Ok(balance) => match ethers::utils::format_ether(balance).parse::<f64>() {
                Ok(eth) => metrics::record_wallet_balance(&self.config.name, eth),
                Err(e) => warn!("{} unable to convert balance {}: {}", self.config.name, balance, e),
            },
            Err(e) => warn!("{} unable to fetch wallet balance: {}", self.config.name, e),
        }
    }
}
