//! Prometheus metrics for the broker.
//!
//! Exposed on the metrics port at /metrics.

#![allow(dead_code)]

use axum::{http::header, response::IntoResponse, routing::get, Router};
use eyre::Result;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, CounterVec, Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Connection metrics
    pub static ref CONNECTED_CLIENTS: IntGauge = register_int_gauge!(
        "clearnode_connected_clients",
        "Number of live WebSocket connections"
    ).unwrap();

    pub static ref AUTHENTICATED_SESSIONS: IntGauge = register_int_gauge!(
        "clearnode_authenticated_sessions",
        "Number of authenticated connections"
    ).unwrap();

    pub static ref MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        "clearnode_messages_received_total",
        "Total number of inbound RPC frames"
    ).unwrap();

    pub static ref MESSAGES_SENT: IntCounter = register_int_counter!(
        "clearnode_messages_sent_total",
        "Total number of outbound frames"
    ).unwrap();

    // RPC metrics
    pub static ref RPC_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "clearnode_rpc_requests_total",
        "Total number of RPC requests",
        &["method", "status"]
    ).unwrap();

    pub static ref RPC_ERRORS: IntCounterVec = register_int_counter_vec!(
        "clearnode_rpc_errors_total",
        "Total number of RPC errors by kind",
        &["kind"]
    ).unwrap();

    // Event pipeline metrics
    pub static ref CONTRACT_EVENTS: IntCounterVec = register_int_counter_vec!(
        "clearnode_contract_events_total",
        "Total number of custody events processed",
        &["chain", "event"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "clearnode_latest_block",
        "Latest reconciled block number",
        &["chain"]
    ).unwrap();

    pub static ref LISTENER_ERRORS: CounterVec = register_counter_vec!(
        "clearnode_listener_errors_total",
        "Total number of listener failures",
        &["chain"]
    ).unwrap();

    // Action worker metrics
    pub static ref ACTIONS_SUBMITTED: IntCounterVec = register_int_counter_vec!(
        "clearnode_actions_submitted_total",
        "Total number of blockchain actions submitted",
        &["action", "status"]
    ).unwrap();
}

/// Serve /metrics on the metrics port.
pub async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/metrics", get(render_metrics));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server started");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&metric_families, &mut buffer);
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], buffer)
}
