//! Batch Submitter - reliable fee-bumping transaction publishing
//!
//! The transaction manager republishes a logical transaction at rising fee
//! caps until one variant confirms. The service loop drives it with batches
//! produced by an application [`service::Driver`].

pub mod chain;
pub mod config;
pub mod drivers;
pub mod error;
pub mod metrics;
pub mod service;
pub mod state;
pub mod tx;
pub mod txmgr;

#[cfg(test)]
mod test_utils;
