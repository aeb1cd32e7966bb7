//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Adapter health per chain
//! - Transaction lifecycle and rollbacks
//! - Quote issuance and expiry
//! - Open ledger holds

use crate::error::FailureReason;
use crate::types::{ChainId, TxKind};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref ADAPTER_HEALTHY: GaugeVec = register_gauge_vec!(
        "zeropoint_adapter_healthy",
        "Adapter health (1=healthy, 0=unavailable)",
        &["chain"]
    ).unwrap();

    pub static ref SUBMIT_RETRIES: CounterVec = register_counter_vec!(
        "zeropoint_submit_retries_total",
        "Submissions retried after a transient adapter failure",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "zeropoint_transactions_created_total",
        "Transactions created by kind",
        &["kind"]
    ).unwrap();

    pub static ref TX_TRANSITIONS: CounterVec = register_counter_vec!(
        "zeropoint_transaction_transitions_total",
        "Transaction state transitions by target status",
        &["status"]
    ).unwrap();

    pub static ref TX_ROLLBACKS: CounterVec = register_counter_vec!(
        "zeropoint_transaction_rollbacks_total",
        "Transactions rolled back by failure reason",
        &["reason"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "zeropoint_confirmation_latency_seconds",
        "Time from submission to confirmation",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    // Mediation metrics
    pub static ref QUOTES_ISSUED: CounterVec = register_counter_vec!(
        "zeropoint_quotes_issued_total",
        "Quotes issued by chain pair",
        &["source_chain", "dest_chain"]
    ).unwrap();

    pub static ref QUOTES_EXPIRED: CounterVec = register_counter_vec!(
        "zeropoint_quotes_expired_total",
        "Quotes redeemed after expiry",
        &[]
    ).unwrap();

    // Ledger metrics
    pub static ref ACTIVE_RESERVATIONS: Gauge = register_gauge!(
        "zeropoint_active_reservations",
        "Open ledger holds"
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

    pub async fn run(&self) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_adapter_health(chain: ChainId, healthy: bool) {
    ADAPTER_HEALTHY
        .with_label_values(&[chain.name()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_submit_retry(chain: ChainId) {
    SUBMIT_RETRIES.with_label_values(&[chain.name()]).inc();
}

pub fn record_transaction_created(kind: TxKind) {
    TX_CREATED.with_label_values(&[kind.as_str()]).inc();
}

pub fn record_transaction_transition(status: &str) {
    TX_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_rollback(reason: FailureReason) {
    TX_ROLLBACKS.with_label_values(&[reason.as_str()]).inc();
}

pub fn record_confirmation_latency(chain: ChainId, latency_secs: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[chain.name()])
        .observe(latency_secs);
}

pub fn record_quote_issued(source: ChainId, dest: ChainId) {
    QUOTES_ISSUED
        .with_label_values(&[source.name(), dest.name()])
        .inc();
}

pub fn record_quote_expired() {
    QUOTES_EXPIRED.with_label_values(&[]).inc();
}

pub fn set_active_reservations(count: usize) {
    ACTIVE_RESERVATIONS.set(count as f64);
}
