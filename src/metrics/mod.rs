//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Watcher connectivity and block progress
//! - HTLC events by chain and kind
//! - Cross-chain action outcomes and latency
//! - Fills and health checks

use crate::chain::Chain;
use crate::error::RelayerResult;
use crate::events::HtlcEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

lazy_static! {
    // Watcher metrics
    pub static ref WATCHER_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_relayer_watcher_connected",
        "Watcher connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref WATCHER_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_relayer_watcher_block_height",
        "Last fully processed block per chain",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_relayer_events_received_total",
        "HTLC events classified by chain and kind",
        &["chain", "kind"]
    ).unwrap();

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "htlc_relayer_events_duplicate_total",
        "Events dropped by the idempotency cache",
        &["chain"]
    ).unwrap();

    pub static ref EVENT_ERRORS: CounterVec = register_counter_vec!(
        "htlc_relayer_event_errors_total",
        "Errors raised while processing an event",
        &["chain", "error"]
    ).unwrap();

    pub static ref EVENTS_IN_FLIGHT: Gauge = register_gauge!(
        "htlc_relayer_events_in_flight",
        "Events currently being applied"
    ).unwrap();

    // Action metrics
    pub static ref ACTIONS_DISPATCHED: CounterVec = register_counter_vec!(
        "htlc_relayer_actions_dispatched_total",
        "Cross-chain actions handed to a resolver",
        &["chain", "kind"]
    ).unwrap();

    pub static ref ACTIONS_SUCCEEDED: CounterVec = register_counter_vec!(
        "htlc_relayer_actions_succeeded_total",
        "Cross-chain actions broadcast successfully",
        &["chain", "kind"]
    ).unwrap();

    pub static ref ACTIONS_ABANDONED: CounterVec = register_counter_vec!(
        "htlc_relayer_actions_abandoned_total",
        "Cross-chain actions abandoned after errors",
        &["chain", "kind", "error"]
    ).unwrap();

    pub static ref ACTION_RETRIES: CounterVec = register_counter_vec!(
        "htlc_relayer_action_retries_total",
        "Resolver attempts that were retried or requeued",
        &["chain", "error"]
    ).unwrap();

    pub static ref ACTION_LATENCY: HistogramVec = register_histogram_vec!(
        "htlc_relayer_action_latency_seconds",
        "Time from dispatch to broadcast",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Order metrics
    pub static ref ORDER_FILLS: CounterVec = register_counter_vec!(
        "htlc_relayer_order_fills_total",
        "Fills applied to orders",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "htlc_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "htlc_relayer_health_check_failure_total",
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

    pub async fn run(&self, cancel: CancellationToken) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

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

pub fn record_watcher_health(chain: Chain, connected: bool) {
    WATCHER_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if connected { 1.0 } else { 0.0 });
}

pub fn record_block_processed(chain: Chain, height: u64) {
    WATCHER_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(height as f64);
}

pub fn record_event(event: &HtlcEvent) {
    EVENTS_RECEIVED
        .with_label_values(&[event.chain.as_str(), event.name()])
        .inc();
}

pub fn record_duplicate_event(chain: Chain) {
    EVENTS_DUPLICATE.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event_error(chain: Chain, error: &str) {
    EVENT_ERRORS
        .with_label_values(&[chain.as_str(), error])
        .inc();
}

pub fn set_events_in_flight(count: usize) {
    EVENTS_IN_FLIGHT.set(count as f64);
}

pub fn record_action_dispatched(chain: Chain, kind: &str) {
    ACTIONS_DISPATCHED
        .with_label_values(&[chain.as_str(), kind])
        .inc();
}

pub fn record_action_succeeded(chain: Chain, kind: &str, latency_secs: f64) {
    ACTIONS_SUCCEEDED
        .with_label_values(&[chain.as_str(), kind])
        .inc();
    ACTION_LATENCY
        .with_label_values(&[chain.as_str()])
        .observe(latency_secs);
}

pub fn record_action_abandoned(chain: Chain, kind: &str, error: &str) {
    ACTIONS_ABANDONED
        .with_label_values(&[chain.as_str(), kind, error])
        .inc();
}

pub fn record_action_retry(chain: Chain, error: &str) {
    ACTION_RETRIES
        .with_label_values(&[chain.as_str(), error])
        .inc();
}

pub fn record_fill(chain: Chain) {
    ORDER_FILLS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
