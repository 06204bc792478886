//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Coin connection status and chain height
//! - Swap lifecycle outcomes and durations
//! - Broadcast retries and reorg regressions

use crate::error::{SwapError, SwapResult};
use crate::swap::FailedStep;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "swap_engine_chain_connected",
        "Coin backend status (1=connected, 0=disconnected)",
        &["coin"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "swap_engine_chain_block_height",
        "Latest block height seen per coin",
        &["coin"]
    ).unwrap();

    pub static ref CONFIRMATION_REGRESSIONS: CounterVec = register_counter_vec!(
        "swap_engine_confirmation_regressions_total",
        "Watched transactions that lost confirmations",
        &["coin"]
    ).unwrap();

    pub static ref BROADCAST_RETRIES: CounterVec = register_counter_vec!(
        "swap_engine_broadcast_retries_total",
        "Broadcast attempts retried after a transient error",
        &["coin"]
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS_STARTED: CounterVec = register_counter_vec!(
        "swap_engine_swaps_started_total",
        "Swaps started by role",
        &["role"]
    ).unwrap();

    pub static ref SWAPS_FINISHED: CounterVec = register_counter_vec!(
        "swap_engine_swaps_finished_total",
        "Swaps that reached Finished",
        &[]
    ).unwrap();

    pub static ref SWAPS_FAILED: CounterVec = register_counter_vec!(
        "swap_engine_swaps_failed_total",
        "Swaps that ended in a failed state, by step",
        &["step"]
    ).unwrap();

    pub static ref SWAPS_REFUNDED: CounterVec = register_counter_vec!(
        "swap_engine_swaps_refunded_total",
        "Swaps whose own payments were refunded",
        &[]
    ).unwrap();

    pub static ref SWAPS_REFUND_FAILED: CounterVec = register_counter_vec!(
        "swap_engine_swaps_refund_failed_total",
        "Swaps whose refund failed",
        &[]
    ).unwrap();

    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "swap_engine_state_transitions_total",
        "Committed swap state transitions",
        &["state"]
    ).unwrap();

    pub static ref SWAP_DURATION: HistogramVec = register_histogram_vec!(
        "swap_engine_swap_duration_seconds",
        "Time from swap creation to its terminal state",
        &["outcome"],
        vec![60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_engine_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_engine_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    gather().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn gather() -> SwapResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| SwapError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| SwapError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(coin: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[coin])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_height(coin: &str, height: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[coin])
        .set(height as f64);
}

pub fn record_confirmation_regression(coin: &str) {
    CONFIRMATION_REGRESSIONS.with_label_values(&[coin]).inc();
}

pub fn record_broadcast_retry(coin: &str) {
    BROADCAST_RETRIES.with_label_values(&[coin]).inc();
}

pub fn record_swap_started(role: &str) {
    SWAPS_STARTED.with_label_values(&[role]).inc();
}

pub fn record_transition(state: &str) {
    STATE_TRANSITIONS.with_label_values(&[state]).inc();
}

pub fn record_swap_finished() {
    SWAPS_FINISHED.with_label_values(&[]).inc();
}

pub fn record_swap_failed(step: FailedStep) {
    SWAPS_FAILED.with_label_values(&[step.name()]).inc();
}

pub fn record_swap_refunded() {
    SWAPS_REFUNDED.with_label_values(&[]).inc();
}

pub fn record_swap_refund_failed() {
    SWAPS_REFUND_FAILED.with_label_values(&[]).inc();
}

pub fn record_swap_duration(outcome: &str, secs: f64) {
    SWAP_DURATION.with_label_values(&[outcome]).observe(secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_exposed() {
        record_chain_height("METRICS_TEST", 42);
        record_swap_failed(FailedStep::TakerFeeValidate);

        let text = gather().unwrap();
        assert!(text.contains("swap_engine_chain_block_height{coin=\"METRICS_TEST\"} 42"));
        assert!(text.contains("step=\"TakerFeeValidate\""));
    }
}
