//! Startup clearing of transactions left in the mempool by a prior instance
//!
//! A zero-value self-transfer is published at the wallet's current nonce and
//! fee-bumped until either it confirms, or the backend reports that the nonce
//! was consumed by the stale transaction, in which case the caller retries
//! with a fresh nonce.

use super::gas::current_fees;
use crate::error::{SubmitterError, SubmitterResult};
use crate::txmgr::{PublisherBackend, SignedTransaction, TxManager, TxMgrError, TxMgrResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionReceipt, U256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Deadline for a single clearing attempt
pub const DEFAULT_CLEAR_PENDING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Signs a zero-value self-transfer at `nonce`, priced at the current market.
pub async fn sign_clearing_tx<B>(
    backend: &B,
    wallet: &LocalWallet,
    nonce: u64,
) -> TxMgrResult<SignedTransaction>
where
    B: PublisherBackend + ?Sized,
{
    let (gas_tip_cap, gas_fee_cap) = current_fees(backend).await?;
    let address = wallet.address();

    let mut tx: TypedTransaction = Eip1559TransactionRequest::new()
        .from(address)
        .to(address)
        .value(U256::zero())
        .nonce(nonce)
        .max_priority_fee_per_gas(gas_tip_cap)
        .max_fee_per_gas(gas_fee_cap)
        .chain_id(wallet.chain_id())
        .into();

    let gas_limit = backend.estimate_gas(&tx).await?;
    tx.set_gas(gas_limit);

    SignedTransaction::sign(tx, wallet)
}

/// Publishes a clearing transaction at the wallet's current nonce.
///
/// Returns the clearing receipt once confirmed,
/// [`SubmitterError::ClearPendingRetry`] if a prior transaction confirmed at
/// that nonce first, or [`SubmitterError::ClearPendingTimeout`] if `timeout`
/// elapses.
pub async fn clear_pending_tx<B>(
    cancel: &CancellationToken,
    txmgr: &TxManager<B>,
    wallet: &LocalWallet,
    timeout: Duration,
) -> SubmitterResult<TransactionReceipt>
where
    B: PublisherBackend + ?Sized,
{
    let name = txmgr.name();
    let backend = txmgr.backend().as_ref();
    let nonce = backend.nonce_at(wallet.address()).await?;

    let scope = cancel.child_token();
    let nonce_consumed = AtomicBool::new(false);

    let update_gas_price = move |_: CancellationToken| {
        info!("{} clearing pending tx (nonce {})", name, nonce);
        sign_clearing_tx(backend, wallet, nonce)
    };

    let scope_ref = &scope;
    let nonce_consumed_ref = &nonce_consumed;
    let send_tx = move |_: CancellationToken, tx: SignedTransaction| async move {
        info!(
            "{} clearing tx (nonce {}, gas_tip_cap {:?}, gas_fee_cap {:?})",
            name,
            nonce,
            tx.gas_tip_cap(),
            tx.gas_fee_cap()
        );
        match backend.send_transaction(&tx).await {
            Ok(()) => {
                info!("{} submitted clearing tx {:?}", name, tx.hash());
                Ok(())
            }
            // The stale transaction (or one of our variants) already took the
            // nonce. Stop bumping so the caller can move on to the next nonce.
            Err(e) if e.is_nonce_too_low() => {
                info!("{} transaction already confirmed, nonce too low", name);
                nonce_consumed_ref.store(true, Ordering::SeqCst);
                scope_ref.cancel();
                Err(e)
            }
            Err(e) => {
                error!("{} unable to submit clearing tx {:?}: {}", name, tx.hash(), e);
                Err(e)
            }
        }
    };

    let send = txmgr.send(&scope, update_gas_price, send_tx);
    tokio::pin!(send);

    let result = tokio::select! {
        result = &mut send => result,
        _ = tokio::time::sleep(timeout) => {
            scope.cancel();
            let _ = send.await;
            warn!("{} clearing pending tx timed out after {:?}", name, timeout);
            return Err(SubmitterError::ClearPendingTimeout);
        }
    };

    match result {
        Ok(receipt) => {
            info!(
                "{} cleared pending tx {:?} in block {:?}",
                name, receipt.transaction_hash, receipt.block_number
            );
            Ok(receipt)
        }
        Err(TxMgrError::Canceled) if nonce_consumed.load(Ordering::SeqCst) => {
            Err(SubmitterError::ClearPendingRetry)
        }
        Err(TxMgrError::Canceled) => Err(SubmitterError::Canceled),
        Err(e) => Err(e.into()),
    }
}
