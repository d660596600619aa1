//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Reconciliation passes and their latency
//! - Outcomes appended per status
//! - Transient failures per upstream
//! - Ledger writes issued by the lifecycle controller

use crate::error::{WatcherError, WatcherResult};
use crate::state::TxStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Reconciliation metrics
    pub static ref TICKS: CounterVec = register_counter_vec!(
        "swap_watcher_reconcile_ticks_total",
        "Total reconciliation passes",
        &["trigger"]
    ).unwrap();

    pub static ref TICK_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_watcher_reconcile_latency_seconds",
        "Reconciliation pass latency",
        &[],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref ORDERS_RESOLVED: CounterVec = register_counter_vec!(
        "swap_watcher_orders_resolved_total",
        "Total unassigned cycles resolved to a round position",
        &[]
    ).unwrap();

    pub static ref OUTCOMES: CounterVec = register_counter_vec!(
        "swap_watcher_outcomes_total",
        "Total history rows appended by status",
        &["status"]
    ).unwrap();

    pub static ref TRANSIENT_ERRORS: CounterVec = register_counter_vec!(
        "swap_watcher_transient_errors_total",
        "Transient upstream failures that deferred work to the next pass",
        &["source"]
    ).unwrap();

    pub static ref OPEN_CYCLES: GaugeVec = register_gauge_vec!(
        "swap_watcher_open_cycles",
        "Cycles awaiting an outcome",
        &[]
    ).unwrap();

    // Lifecycle metrics
    pub static ref LEDGER_WRITES: CounterVec = register_counter_vec!(
        "swap_watcher_ledger_writes_total",
        "Ledger writes by kind and result",
        &["kind", "result"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_watcher_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_watcher_health_check_failure_total",
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

    pub async fn run(&self) -> WatcherResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| WatcherError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| WatcherError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_tick(trigger: &str) {
    TICKS.with_label_values(&[trigger]).inc();
}

pub fn record_tick_latency(latency_secs: f64) {
    TICK_LATENCY.with_label_values(&[]).observe(latency_secs);
}

pub fn record_order_resolved() {
    ORDERS_RESOLVED.with_label_values(&[]).inc();
}

pub fn record_outcome(status: TxStatus) {
    OUTCOMES.with_label_values(&[status.as_str()]).inc();
}

pub fn record_transient_error(source: &str) {
    TRANSIENT_ERRORS.with_label_values(&[source]).inc();
}

pub fn record_open_cycles(count: u64) {
    OPEN_CYCLES.with_label_values(&[]).set(count as f64);
}

pub fn record_ledger_write(kind: &str, ok: bool) {
    LEDGER_WRITES
        .with_label_values(&[kind, if ok { "ok" } else { "error" }])
        .inc();
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

    #[tokio::test]
    async fn test_recorded_outcomes_are_exported() {
        record_outcome(TxStatus::ReimburseAvailable);
        record_ledger_write("cancel", true);

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("swap_watcher_outcomes_total"));
        assert!(body.contains("REIMBURSE_AVAILABLE"));
        assert!(body.contains("swap_watcher_ledger_writes_total"));
    }
}
