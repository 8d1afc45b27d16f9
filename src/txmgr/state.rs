//! Per-send observation ledger shared by concurrent publish workers

use super::error::{TxMgrError, TxMgrResult};

use ethers::types::H256;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Observations {
    /// Hashes currently reported mined (may shrink on reorg)
    mined_txs: HashSet<H256>,
    /// Nonce-too-low errors seen since the last reorg reset
    nonce_too_low_count: u64,
}

/// Tracks what the publish workers of a single `send` have observed.
///
/// Both fields live behind one lock so `should_abort_immediately` always sees
/// a consistent pair.
#[derive(Debug)]
pub struct SendState {
    observations: RwLock<Observations>,
    safe_abort_nonce_too_low_count: u64,
}

impl SendState {
    /// Create a new send state. `safe_abort_nonce_too_low_count` must be at least 1.
    pub fn new(safe_abort_nonce_too_low_count: u64) -> TxMgrResult<Self> {
        if safe_abort_nonce_too_low_count == 0 {
            return Err(TxMgrError::Config(
                "safe_abort_nonce_too_low_count cannot be zero".to_string(),
            ));
        }

        Ok(Self {
            observations: RwLock::new(Observations::default()),
            safe_abort_nonce_too_low_count,
        })
    }

    /// Records the outcome of a publish attempt. Only nonce-too-low errors
    /// are counted.
    pub fn process_send_error(&self, err: Option<&TxMgrError>) {
        match err {
            Some(err) if err.is_nonce_too_low() => {
                let mut obs = self.write();
                obs.nonce_too_low_count += 1;
                debug!("Nonce too low observed ({} total)", obs.nonce_too_low_count);
            }
            _ => {}
        }
    }

    /// Marks `tx_hash` as mined. Idempotent.
    pub fn tx_mined(&self, tx_hash: H256) {
        self.write().mined_txs.insert(tx_hash);
    }

    /// Marks `tx_hash` as not mined.
    ///
    /// If this removes the last mined hash the nonce-too-low counter is reset:
    /// errors seen before a reorg say nothing about the post-reorg chain.
    pub fn tx_not_mined(&self, tx_hash: H256) {
        let mut obs = self.write();
        let was_mined = obs.mined_txs.remove(&tx_hash);
        if was_mined && obs.mined_txs.is_empty() {
            debug!("Transaction {:?} reorged out, resetting nonce too low count", tx_hash);
            obs.nonce_too_low_count = 0;
        }
    }

    /// True while at least one published variant is mined but not yet deep enough.
    pub fn is_waiting_for_confirmation(&self) -> bool {
        !self.read().mined_txs.is_empty()
    }

    /// True iff nothing is mined and enough nonce-too-low errors have piled up
    /// to conclude the nonce was consumed by someone else.
    pub fn should_abort_immediately(&self) -> bool {
        let obs = self.read();
        obs.mined_txs.is_empty() && obs.nonce_too_low_count >= self.safe_abort_nonce_too_low_count
    }

    pub fn nonce_too_low_count(&self) -> u64 {
        self.read().nonce_too_low_count
    }

    fn read(&self) -> RwLockReadGuard<'_, Observations> {
        self.observations.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Observations> {
        self.observations.write().unwrap_or_else(PoisonError::into_inner)
    }
}
