//! Error types for the batch submitter service

use crate::txmgr::TxMgrError;

use thiserror::Error;

/// Main error type for the submitter service and its drivers
#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction manager error: {0}")]
    TxMgr(#[from] TxMgrError),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A prior transaction consumed the clearing nonce; refetch and retry.
    #[error("clear pending tx: retry with next nonce")]
    ClearPendingRetry,

    #[error("clear pending tx: timed out")]
    ClearPendingTimeout,

    #[error("operation canceled")]
    Canceled,
}

impl SubmitterError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitterError::ChainConnection { .. }
            | SubmitterError::ClearPendingRetry
            | SubmitterError::ClearPendingTimeout
            | SubmitterError::Database(_) => true,
            SubmitterError::TxMgr(e) => matches!(e, TxMgrError::Rpc(_)),
            _ => false,
        }
    }

    /// True for shutdown-induced cancellation, which is not worth logging as a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            SubmitterError::Canceled | SubmitterError::TxMgr(TxMgrError::Canceled)
        )
    }
}

/// Result type for submitter operations
pub type SubmitterResult<T> = Result<T, SubmitterError>;
