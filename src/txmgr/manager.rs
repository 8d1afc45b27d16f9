//! Fee-bumping transaction manager
//!
//! A single logical transaction is republished at the current gas market every
//! `resubmission_timeout` until one of its variants reaches the configured
//! confirmation depth. Each publish runs in its own worker; the first confirmed
//! receipt wins and all workers are drained before `send` returns.

use super::backend::ReceiptSource;
use super::error::{TxMgrError, TxMgrResult};
use super::state::SendState;
use super::transaction::SignedTransaction;
use super::wait::wait_mined;

use ethers::types::{TransactionReceipt, U64};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Immutable transaction manager configuration
#[derive(Debug, Clone)]
pub struct TxMgrConfig {
    /// Interval between republishes while no variant is mined
    pub resubmission_timeout: Duration,
    /// Polling interval for receipts
    pub receipt_query_interval: Duration,
    /// Blocks required to consider a tx final, at least 1
    pub num_confirmations: u64,
    /// Nonce-too-low observations tolerated before giving up, at least 1
    pub safe_abort_nonce_too_low_count: u64,
}

impl TxMgrConfig {
    pub fn validate(&self) -> TxMgrResult<()> {
        if self.num_confirmations == 0 {
            return Err(TxMgrError::Config(
                "num_confirmations cannot be zero".to_string(),
            ));
        }
        if self.safe_abort_nonce_too_low_count == 0 {
            return Err(TxMgrError::Config(
                "safe_abort_nonce_too_low_count cannot be zero".to_string(),
            ));
        }
        if self.resubmission_timeout.is_zero() || self.receipt_query_interval.is_zero() {
            return Err(TxMgrError::Config(
                "resubmission and receipt query intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Publishes transactions with increasing fees until one confirms.
///
/// `send` must not be called concurrently on the same instance.
pub struct TxManager<B: ?Sized> {
    name: String,
    config: TxMgrConfig,
    backend: Arc<B>,
}

impl<B> TxManager<B>
where
    B: ReceiptSource + ?Sized,
{
    /// Create a new transaction manager, rejecting invalid configuration
    pub fn new(name: impl Into<String>, config: TxMgrConfig, backend: Arc<B>) -> TxMgrResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            backend,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Publishes the transaction produced by `update_gas_price` through
    /// `send_tx`, repricing and republishing until a variant confirms.
    ///
    /// Returns the first receipt with `num_confirmations` confirmations, or
    /// [`TxMgrError::Reverted`] carrying the receipt if that transaction
    /// reverted. Cancellation of `cancel`, or a nonce that was consumed by
    /// another transaction, yields [`TxMgrError::Canceled`].
    pub async fn send<U, UFut, S, SFut>(
        &self,
        cancel: &CancellationToken,
        update_gas_price: U,
        send_tx: S,
    ) -> TxMgrResult<TransactionReceipt>
    where
        U: Fn(CancellationToken) -> UFut + Send + Sync,
        UFut: Future<Output = TxMgrResult<SignedTransaction>> + Send,
        S: Fn(CancellationToken, SignedTransaction) -> SFut + Send + Sync,
        SFut: Future<Output = TxMgrResult<()>> + Send,
    {
        let scope = cancel.child_token();
        let state = SendState::new(self.config.safe_abort_nonce_too_low_count)?;
        let (receipt_tx, mut receipt_rx) = mpsc::channel::<TransactionReceipt>(1);

        let mut workers = FuturesUnordered::new();
        workers.push(self.publish_and_wait(&scope, &state, &update_gas_price, &send_tx, &receipt_tx));

        let period = self.config.resubmission_timeout;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                Some(receipt) = receipt_rx.recv() => break Ok(receipt),
                _ = scope.cancelled() => break Err(TxMgrError::Canceled),
                _ = ticker.tick() => {
                    // A mined variant is still gathering confirmations, a
                    // further bump would only compete with it.
                    if state.is_waiting_for_confirmation() {
                        debug!("{} waiting for confirmation, skipping republish", self.name);
                        continue;
                    }
                    workers.push(
                        self.publish_and_wait(&scope, &state, &update_gas_price, &send_tx, &receipt_tx),
                    );
                }
                Some(()) = workers.next(), if !workers.is_empty() => {}
            }
        };

        scope.cancel();
        while workers.next().await.is_some() {}

        let receipt = result?;
        if receipt.status == Some(U64::zero()) {
            warn!(
                "{} transaction {:?} reverted in block {:?}",
                self.name, receipt.transaction_hash, receipt.block_number
            );
            return Err(TxMgrError::Reverted(Box::new(receipt)));
        }
        Ok(receipt)
    }

    /// One publish attempt: reprice, publish, then wait for confirmations.
    async fn publish_and_wait<U, UFut, S, SFut>(
        &self,
        scope: &CancellationToken,
        state: &SendState,
        update_gas_price: &U,
        send_tx: &S,
        receipt_tx: &mpsc::Sender<TransactionReceipt>,
    ) where
        U: Fn(CancellationToken) -> UFut,
        UFut: Future<Output = TxMgrResult<SignedTransaction>>,
        S: Fn(CancellationToken, SignedTransaction) -> SFut,
        SFut: Future<Output = TxMgrResult<()>>,
    {
        let updated = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            updated = update_gas_price(scope.clone()) => updated,
        };
        let tx = match updated {
            Ok(tx) => tx,
            Err(TxMgrError::Canceled) => return,
            Err(e) => {
                error!("{} unable to update txn gas price: {}", self.name, e);
                return;
            }
        };

        info!(
            "{} publishing transaction {:?} (nonce {:?}, gas_tip_cap {:?}, gas_fee_cap {:?})",
            self.name,
            tx.hash(),
            tx.nonce(),
            tx.gas_tip_cap(),
            tx.gas_fee_cap()
        );

        let sent = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            sent = send_tx(scope.clone(), tx.clone()) => sent,
        };
        state.process_send_error(sent.as_ref().err());
        crate::metrics::record_publish(&self.name, sent.as_ref().err());

        match sent {
            Ok(()) => {}
            Err(TxMgrError::Canceled) => return,
            Err(e) => {
                error!("{} unable to publish transaction {:?}: {}", self.name, tx.hash(), e);
                if state.should_abort_immediately() {
                    warn!(
                        "{} aborting send after {} nonce too low errors",
                        self.name,
                        state.nonce_too_low_count()
                    );
                    scope.cancel();
                }
                return;
            }
        }

        info!("{} transaction {:?} published successfully", self.name, tx.hash());

        let waited = wait_mined(
            scope,
            self.backend.as_ref(),
            tx.hash(),
            self.config.receipt_query_interval,
            self.config.num_confirmations,
            Some(state),
        )
        .await;

        match waited {
            // A full channel means another worker already delivered.
            Ok(receipt) => {
                let _ = receipt_tx.try_send(receipt);
            }
            Err(e) => debug!("{} stopped waiting for {:?}: {}", self.name, tx.hash(), e),
        }
    }
}
