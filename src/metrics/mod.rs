//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Channel connectivity and reconnects
//! - Events received, keepalives filtered, malformed messages
//! - Unknown events and relayed-event routing misses
//! - Registered participants

use crate::channel::{ChannelId, ConnectivityState};
use crate::error::{MonitorError, MonitorResult};
use crate::events::event_label;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Channel metrics
    pub static ref CHANNEL_CONNECTED: GaugeVec = register_gauge_vec!(
        "twopc_channel_connected",
        "Channel connection status (1=connected, 0=disconnected)",
        &["channel"]
    ).unwrap();

    pub static ref CHANNEL_RECONNECTS: CounterVec = register_counter_vec!(
        "twopc_channel_reconnects_total",
        "Total reconnect attempts by channel kind",
        &["channel_kind"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "twopc_events_received_total",
        "Total decoded events by channel kind and type",
        &["channel_kind", "event_type"]
    ).unwrap();

    pub static ref KEEPALIVES: CounterVec = register_counter_vec!(
        "twopc_keepalives_total",
        "Total keepalive messages filtered",
        &["channel_kind"]
    ).unwrap();

    pub static ref MALFORMED_MESSAGES: CounterVec = register_counter_vec!(
        "twopc_malformed_messages_total",
        "Total messages dropped because they could not be decoded",
        &["channel_kind"]
    ).unwrap();

    pub static ref UNKNOWN_EVENTS: CounterVec = register_counter_vec!(
        "twopc_unknown_events_total",
        "Total events with an unrecognized type",
        &["channel_kind"]
    ).unwrap();

    pub static ref ROUTING_MISSES: CounterVec = register_counter_vec!(
        "twopc_routing_misses_total",
        "Total relayed events addressed to unregistered participants",
        &[]
    ).unwrap();

    // Session metrics
    pub static ref PARTICIPANTS_REGISTERED: GaugeVec = register_gauge_vec!(
        "twopc_participants_registered",
        "Participants registered in the current session",
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

    pub async fn run(&self) -> MonitorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| MonitorError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| MonitorError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of all registered metrics
pub fn render() -> MonitorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| MonitorError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MonitorError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_connectivity(channel: &ChannelId, state: ConnectivityState) {
    CHANNEL_CONNECTED
        .with_label_values(&[&channel.to_string()])
        .set(match state {
            ConnectivityState::Connected => 1.0,
            ConnectivityState::Disconnected => 0.0,
        });
}

pub fn record_reconnect(channel: &ChannelId) {
    CHANNEL_RECONNECTS
        .with_label_values(&[channel.kind()])
        .inc();
}

pub fn record_event(channel: &ChannelId, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[channel.kind(), event_label(event_type)])
        .inc();
}

pub fn record_keepalive(channel: &ChannelId) {
    KEEPALIVES.with_label_values(&[channel.kind()]).inc();
}

pub fn record_malformed(channel: &ChannelId) {
    MALFORMED_MESSAGES
        .with_label_values(&[channel.kind()])
        .inc();
}

pub fn record_unknown_event(channel: &ChannelId) {
    UNKNOWN_EVENTS.with_label_values(&[channel.kind()]).inc();
}

pub fn record_routing_miss() {
    ROUTING_MISSES.with_label_values(&[]).inc();
}

pub fn record_participants(count: usize) {
    PARTICIPANTS_REGISTERED
        .with_label_values(&[])
        .set(count as f64);
}
