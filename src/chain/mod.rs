//! Chain module - JSON-RPC connectivity for the submitter
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The transaction manager backends over ethers HTTP providers
//! - Event log queries for deposit ingestion

pub mod provider;

pub use provider::ChainProvider;

use crate::txmgr::TxMgrResult;
use async_trait::async_trait;
use ethers::types::{Filter, Log};

/// Source of contract event logs.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Returns the logs matching `filter`, in chain order.
    async fn logs(&self, filter: &Filter) -> TxMgrResult<Vec<Log>>;
}
