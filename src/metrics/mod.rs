//! Prometheus metrics for monitoring
//!
//! Every series is labelled with the submitting `service`. Exposes metrics for:
//! - Wallet balance
//! - Batch size and submission outcomes
//! - Transaction manager publish attempts
//! - Disbursement bookkeeping

use crate::error::SubmitterResult;
use crate::txmgr::TxMgrError;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "batch_submitter_wallet_balance_eth",
        "Balance of the submitting wallet in ETH",
        &["service"]
    ).unwrap();

    // Batch metrics
    pub static ref BATCH_SIZE_BYTES: HistogramVec = register_histogram_vec!(
        "batch_submitter_batch_size_bytes",
        "Calldata size of submitted batch transactions",
        &["service"],
        vec![128.0, 512.0, 2048.0, 8192.0, 32768.0, 131072.0]
    ).unwrap();

    pub static ref NUM_ELEMENTS_PER_BATCH: HistogramVec = register_histogram_vec!(
        "batch_submitter_num_elements_per_batch",
        "Number of elements in each crafted batch",
        &["service"],
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]
    ).unwrap();

    pub static ref BATCH_SUBMISSION_TIMESTAMP: GaugeVec = register_gauge_vec!(
        "batch_submitter_last_submission_timestamp_seconds",
        "Unix time of the last confirmed batch",
        &["service"]
    ).unwrap();

    pub static ref BATCH_TX_GAS_USED: GaugeVec = register_gauge_vec!(
        "batch_submitter_batch_tx_gas_used",
        "Gas used by the last confirmed batch transaction",
        &["service"]
    ).unwrap();

    pub static ref BATCHES_SUBMITTED: CounterVec = register_counter_vec!(
        "batch_submitter_batches_submitted_total",
        "Total batches confirmed",
        &["service"]
    ).unwrap();

    pub static ref BATCHES_REVERTED: CounterVec = register_counter_vec!(
        "batch_submitter_batches_reverted_total",
        "Total batches confirmed with a reverted status",
        &["service"]
    ).unwrap();

    pub static ref BATCH_CONFIRMATION_TIME: HistogramVec = register_histogram_vec!(
        "batch_submitter_batch_confirmation_time_seconds",
        "Time from first publish to confirmation",
        &["service"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Transaction manager metrics
    pub static ref TXMGR_PUBLISH: CounterVec = register_counter_vec!(
        "batch_submitter_txmgr_publish_total",
        "Publish attempts by outcome",
        &["service", "outcome"]
    ).unwrap();

    pub static ref CLEARING_ATTEMPTS: CounterVec = register_counter_vec!(
        "batch_submitter_clearing_attempts_total",
        "Clearing procedure attempts by outcome",
        &["service", "outcome"]
    ).unwrap();

    // Disbursement metrics
    pub static ref SUCCESSFUL_DISBURSEMENTS: CounterVec = register_counter_vec!(
        "batch_submitter_successful_disbursements_total",
        "Disbursements confirmed as successful",
        &["service"]
    ).unwrap();

    pub static ref FAILED_DISBURSEMENTS: CounterVec = register_counter_vec!(
        "batch_submitter_failed_disbursements_total",
        "Disbursements confirmed as failed",
        &["service"]
    ).unwrap();

    pub static ref CONTRACT_NEXT_DISBURSEMENT_ID: GaugeVec = register_gauge_vec!(
        "batch_submitter_contract_next_disbursement_id",
        "Next disbursement id according to the disburser contract",
        &["service"]
    ).unwrap();

    pub static ref POSTGRES_LAST_DISBURSED_ID: GaugeVec = register_gauge_vec!(
        "batch_submitter_postgres_last_disbursed_id",
        "Last disbursement id recorded in the database",
        &["service"]
    ).unwrap();

    pub static ref DEPOSIT_ID_MISMATCH: GaugeVec = register_gauge_vec!(
        "batch_submitter_deposit_id_mismatch",
        "Consecutive polls where the database lagged the contract",
        &["service"]
    ).unwrap();

    pub static ref MISSING_DISBURSEMENTS: GaugeVec = register_gauge_vec!(
        "batch_submitter_missing_disbursements",
        "Confirmed deposits below the contract's next id without a disbursement",
        &["service"]
    ).unwrap();

    pub static ref DEPOSIT_CONTRACT_BALANCE: GaugeVec = register_gauge_vec!(
        "batch_submitter_deposit_contract_balance_eth",
        "Balance of the L1 deposit contract in ETH",
        &["service"]
    ).unwrap();

    pub static ref FAILED_DATABASE_METHODS: CounterVec = register_counter_vec!(
        "batch_submitter_failed_database_methods_total",
        "Database failures by method",
        &["service", "method"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SubmitterResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

/// Label for a publish outcome
pub fn publish_outcome(err: Option<&TxMgrError>) -> &'static str {
    match err {
        None => "ok",
        Some(e) if e.is_nonce_too_low() => "nonce_too_low",
        Some(TxMgrError::Canceled) => "canceled",
        Some(_) => "error",
    }
}

pub fn record_publish(service: &str, err: Option<&TxMgrError>) {
    TXMGR_PUBLISH
        .with_label_values(&[service, publish_outcome(err)])
        .inc();
}

pub fn record_clearing_attempt(service: &str, outcome: &str) {
    CLEARING_ATTEMPTS
        .with_label_values(&[service, outcome])
        .inc();
}

pub fn record_wallet_balance(service: &str, balance_eth: f64) {
    WALLET_BALANCE
        .with_label_values(&[service])
        .set(balance_eth);
}

pub fn record_deposit_contract_balance(service: &str, balance_eth: f64) {
    DEPOSIT_CONTRACT_BALANCE
        .with_label_values(&[service])
        .set(balance_eth);
}

pub fn record_batch_size(service: &str, size_bytes: usize) {
    BATCH_SIZE_BYTES
        .with_label_values(&[service])
        .observe(size_bytes as f64);
}

pub fn record_num_elements(service: &str, num_elements: usize) {
    NUM_ELEMENTS_PER_BATCH
        .with_label_values(&[service])
        .observe(num_elements as f64);
}

pub fn record_batch_confirmed(service: &str, gas_used: f64, latency_secs: f64) {
    BATCHES_SUBMITTED.with_label_values(&[service]).inc();
    BATCH_TX_GAS_USED.with_label_values(&[service]).set(gas_used);
    BATCH_CONFIRMATION_TIME
        .with_label_values(&[service])
        .observe(latency_secs);
    BATCH_SUBMISSION_TIMESTAMP
        .with_label_values(&[service])
        .set(chrono::Utc::now().timestamp() as f64);
}

pub fn record_batch_reverted(service: &str) {
    BATCHES_REVERTED.with_label_values(&[service]).inc();
}

pub fn record_disbursements(service: &str, successful: usize, failed: usize) {
    SUCCESSFUL_DISBURSEMENTS
        .with_label_values(&[service])
        .inc_by(successful as f64);
    FAILED_DISBURSEMENTS
        .with_label_values(&[service])
        .inc_by(failed as f64);
}

pub fn record_contract_next_disbursement_id(service: &str, id: u64) {
    CONTRACT_NEXT_DISBURSEMENT_ID
        .with_label_values(&[service])
        .set(id as f64);
}

pub fn record_last_disbursed_id(service: &str, id: u64) {
    POSTGRES_LAST_DISBURSED_ID
        .with_label_values(&[service])
        .set(id as f64);
}

pub fn record_deposit_id_mismatch(service: &str, mismatched: bool) {
    let gauge = DEPOSIT_ID_MISMATCH.with_label_values(&[service]);
    if mismatched {
        gauge.inc();
    } else {
        gauge.set(0.0);
    }
}

pub fn record_missing_disbursements(service: &str, count: usize) {
    MISSING_DISBURSEMENTS
        .with_label_values(&[service])
        .set(count as f64);
}

pub fn record_database_failure(service: &str, method: &str) {
    FAILED_DATABASE_METHODS
        .with_label_values(&[service, method])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_outcome_labels() {
        assert_eq!(publish_outcome(None), "ok");
        assert_eq!(
            publish_outcome(Some(&TxMgrError::from_rpc_error("nonce too low"))),
            "nonce_too_low"
        );
        assert_eq!(publish_outcome(Some(&TxMgrError::Canceled)), "canceled");
        assert_eq!(
            publish_outcome(Some(&TxMgrError::Rpc("timeout".to_string()))),
            "error"
        );
    }

    #[test]
    fn test_record_publish_increments_outcome() {
        let service = "METRICS_TEST_PUBLISH";
        record_publish(service, None);
        record_publish(service, None);
        record_publish(service, Some(&TxMgrError::from_rpc_error("nonce too low")));

        assert_eq!(TXMGR_PUBLISH.with_label_values(&[service, "ok"]).get(), 2.0);
        assert_eq!(
            TXMGR_PUBLISH
                .with_label_values(&[service, "nonce_too_low"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_deposit_id_mismatch_resets() {
        let service = "METRICS_TEST_MISMATCH";
        record_deposit_id_mismatch(service, true);
        record_deposit_id_mismatch(service, true);
        assert_eq!(DEPOSIT_ID_MISMATCH.with_label_values(&[service]).get(), 2.0);

        record_deposit_id_mismatch(service, false);
        assert_eq!(DEPOSIT_ID_MISMATCH.with_label_values(&[service]).get(), 0.0);
    }
}
