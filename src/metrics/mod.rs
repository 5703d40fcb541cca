//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Resend cycle outcomes (confirmed, resent, rejected, stuck)
//! - Log buffer throughput (enqueued, dropped, dequeued)

use crate::error::Result;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, Counter, CounterVec, Encoder, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Resender metrics
    pub static ref RESEND_CYCLES: Counter = register_counter!(
        "chainward_resend_cycles_total",
        "Total reconciliation cycles run"
    ).unwrap();

    pub static ref RESEND_CYCLE_ERRORS: CounterVec = register_counter_vec!(
        "chainward_resend_cycle_errors_total",
        "Per-address reconciliation failures",
        &["address"]
    ).unwrap();

    pub static ref TXS_CONFIRMED: Counter = register_counter!(
        "chainward_txs_confirmed_total",
        "Unconfirmed transactions observed mined past their nonce"
    ).unwrap();

    pub static ref TXS_RESENT: Counter = register_counter!(
        "chainward_txs_resent_total",
        "Attempts successfully rebroadcast"
    ).unwrap();

    pub static ref RESENDS_REJECTED: Counter = register_counter!(
        "chainward_resends_rejected_total",
        "Rebroadcast attempts rejected by the node"
    ).unwrap();

    pub static ref STUCK_TXS: Counter = register_counter!(
        "chainward_stuck_txs_total",
        "Transactions at the bump cap, resent at their last fee"
    ).unwrap();

    // Log buffer metrics
    pub static ref BUFFER_LOGS_ENQUEUED: Counter = register_counter!(
        "chainward_buffer_logs_enqueued_total",
        "Log events accepted into the buffer"
    ).unwrap();

    pub static ref BUFFER_LOGS_DROPPED: Counter = register_counter!(
        "chainward_buffer_logs_dropped_total",
        "Log events dropped by capacity or lookback limits"
    ).unwrap();

    pub static ref BUFFER_LOGS_DEQUEUED: Counter = register_counter!(
        "chainward_buffer_logs_dequeued_total",
        "Log events handed to the consumer"
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

    pub async fn run(&self) -> Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::Error::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_resend_cycle() {
    RESEND_CYCLES.inc();
}

pub fn record_cycle_error(address: &ethers::types::Address) {
    RESEND_CYCLE_ERRORS
        .with_label_values(&[&format!("{:?}", address)])
        .inc();
}

pub fn record_txs_confirmed(count: usize) {
    TXS_CONFIRMED.inc_by(count as f64);
}

pub fn record_tx_resent() {
    TXS_RESENT.inc();
}

pub fn record_resend_rejected() {
    RESENDS_REJECTED.inc();
}

pub fn record_stuck_tx() {
    STUCK_TXS.inc();
}

pub fn record_logs_enqueued(count: usize) {
    BUFFER_LOGS_ENQUEUED.inc_by(count as f64);
}

pub fn record_logs_dropped(count: usize) {
    BUFFER_LOGS_DROPPED.inc_by(count as f64);
}

pub fn record_logs_dequeued(count: usize) {
    BUFFER_LOGS_DEQUEUED.inc_by(count as f64);
}
