//! Transaction manager
//!
//! Publishes a transaction, bumps its fees on a fixed cadence and returns the
//! first receipt that reaches the configured confirmation depth.

mod backend;
mod error;
mod manager;
mod state;
mod transaction;
mod wait;

pub use backend::{PublisherBackend, ReceiptSource};
pub use error::{TxMgrError, TxMgrResult, MAX_PRIORITY_FEE_NOT_FOUND, NONCE_TOO_LOW};
pub use manager::{TxManager, TxMgrConfig};
pub use state::SendState;
pub use transaction::SignedTransaction;
pub use wait::{is_confirmed, wait_mined};
