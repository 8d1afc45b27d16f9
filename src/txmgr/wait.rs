//! Confirmation waiting
//!
//! A transaction is final once `num_confs` blocks, counting its own, sit on
//! top of the chain. Backend failures never end the wait; only cancellation
//! does.

use super::backend::ReceiptSource;
use super::error::{TxMgrError, TxMgrResult};
use super::state::SendState;

use ethers::types::{TransactionReceipt, H256};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Returns true if a tx included at `tx_height` has `num_confs` confirmations
/// with the tip at `tip_height`.
///
/// Equivalent to `tx_height + num_confs - 1 <= tip_height`, arranged so that
/// nothing underflows at `tip_height = 0`.
pub fn is_confirmed(tx_height: u64, num_confs: u64, tip_height: u64) -> bool {
    tx_height.saturating_add(num_confs) <= tip_height.saturating_add(1)
}

/// Polls `backend` every `query_interval` until `tx_hash` has `num_confs`
/// confirmations, then returns its receipt.
///
/// Mined / not-mined observations are fed into `send_state` when provided.
/// Returns [`TxMgrError::Canceled`] once `cancel` fires.
pub async fn wait_mined<B>(
    cancel: &CancellationToken,
    backend: &B,
    tx_hash: H256,
    query_interval: Duration,
    num_confs: u64,
    send_state: Option<&SendState>,
) -> TxMgrResult<TransactionReceipt>
where
    B: ReceiptSource + ?Sized,
{
    let mut ticker = interval_at(Instant::now() + query_interval, query_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TxMgrError::Canceled),
            _ = ticker.tick() => {}
        }

        let lookup = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TxMgrError::Canceled),
            lookup = backend.transaction_receipt(tx_hash) => lookup,
        };

        let receipt = match lookup {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                trace!("Transaction {:?} not yet mined", tx_hash);
                if let Some(state) = send_state {
                    state.tx_not_mined(tx_hash);
                }
                continue;
            }
            Err(e) => {
                trace!("Receipt retrieval for {:?} failed: {}", tx_hash, e);
                continue;
            }
        };

        if let Some(state) = send_state {
            state.tx_mined(tx_hash);
        }

        let Some(tx_height) = receipt.block_number.map(|n| n.as_u64()) else {
            debug!("Receipt for {:?} has no block number yet", tx_hash);
            continue;
        };

        let tip = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TxMgrError::Canceled),
            tip = backend.block_number() => tip,
        };
        let tip_height = match tip {
            Ok(height) => height,
            Err(e) => {
                warn!("Unable to fetch tip height: {}", e);
                continue;
            }
        };

        if is_confirmed(tx_height, num_confs, tip_height) {
            info!(
                "Transaction {:?} confirmed in block {} (tip {})",
                tx_hash, tx_height, tip_height
            );
            return Ok(receipt);
        }

        // Cannot underflow, the confirmation check above failed.
        let confs_remaining = (tx_height + num_confs) - (tip_height + 1);
        debug!(
            "Transaction {:?} mined in block {}, {} confirmations remaining",
            tx_hash, tx_height, confs_remaining
        );
    }
}
