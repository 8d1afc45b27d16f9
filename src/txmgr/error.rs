//! Error types for the transaction manager

use ethers::types::TransactionReceipt;
use thiserror::Error;

/// Canonical message fragment returned by execution clients when a nonce has
/// already been consumed by a confirmed transaction.
pub const NONCE_TOO_LOW: &str = "nonce too low";

/// Message fragment returned by backends that do not implement
/// `eth_maxPriorityFeePerGas`.
pub const MAX_PRIORITY_FEE_NOT_FOUND: &str = "method eth_maxPriorityFeePerGas not found";

/// Errors surfaced by the transaction manager and its backends
#[derive(Error, Debug)]
pub enum TxMgrError {
    /// The caller's token (or the send's own scope) was cancelled.
    #[error("context canceled")]
    Canceled,

    /// The transaction confirmed but its execution reverted.
    #[error("transaction reverted in block {:?}", .0.block_number)]
    Reverted(Box<TransactionReceipt>),

    #[error("nonce too low: {0}")]
    NonceTooLow(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("invalid txmgr configuration: {0}")]
    Config(String),

    #[error("signing error: {0}")]
    Signing(String),
}

impl TxMgrError {
    /// Classifies an error returned by the backend from its message.
    ///
    /// Backends wrap errors heterogeneously, so the nonce-too-low case is
    /// detected by substring rather than by type.
    pub fn from_rpc_error(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains(NONCE_TOO_LOW) {
            TxMgrError::NonceTooLow(message)
        } else {
            TxMgrError::Rpc(message)
        }
    }

    /// Check if the error signals that the nonce was already consumed
    pub fn is_nonce_too_low(&self) -> bool {
        match self {
            TxMgrError::NonceTooLow(_) => true,
            other => other.to_string().to_lowercase().contains(NONCE_TOO_LOW),
        }
    }

    /// Check if the backend rejected `eth_maxPriorityFeePerGas`
    pub fn is_max_priority_fee_not_found(&self) -> bool {
        self.to_string()
            .to_lowercase()
            .contains(&MAX_PRIORITY_FEE_NOT_FOUND.to_lowercase())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TxMgrError::Canceled)
    }

    /// Returns the receipt of a confirmed transaction that reverted.
    pub fn reverted_receipt(&self) -> Option<&TransactionReceipt> {
        match self {
            TxMgrError::Reverted(receipt) => Some(receipt),
            _ => None,
        }
    }
}

/// Result type for transaction manager operations
pub type TxMgrResult<T> = Result<T, TxMgrError>;
