//! HTTP API for health checks, dashboard snapshots, and audit logs

use crate::channel::ChannelId;
use crate::config::ApiConfig;
use crate::coordination::{DashboardSnapshot, MonitorEngine};
use crate::error::{MonitorError, MonitorResult};
use crate::events::{EventEnvelope, ParticipantId};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MonitorEngine>,
    pub started: Instant,
}

/// Build the API router
pub fn router(engine: Arc<MonitorEngine>) -> Router {
    let state = AppState {
        engine,
        started: Instant::now(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/log", get(get_merged_log))
        .route("/log/coordinator", get(get_coordinator_log))
        .route("/log/participants/:id", get(get_participant_log))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<MonitorEngine>) -> MonitorResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MonitorError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| MonitorError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Current status of the coordinator and every participant
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        dashboard: state.engine.snapshot().await,
    })
}

/// Audit log of all channels, interleaved by timestamp
async fn get_merged_log(State(state): State<AppState>) -> impl IntoResponse {
    Json(LogResponse::new(state.engine.merged_log().await))
}

async fn get_coordinator_log(State(state): State<AppState>) -> Response {
    log_response(state.engine.channel_log(&ChannelId::Coordinator).await)
}

async fn get_participant_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let channel = ChannelId::Participant(ParticipantId::new(id));
    log_response(state.engine.channel_log(&channel).await)
}

fn log_response(result: MonitorResult<Vec<EventEnvelope>>) -> Response {
    match result {
        Ok(events) => (StatusCode::OK, Json(LogResponse::new(events))).into_response(),
        Err(e @ (MonitorError::ParticipantNotFound { .. } | MonitorError::ChannelNotFound { .. })) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    #[serde(flatten)]
    dashboard: DashboardSnapshot,
}

#[derive(Serialize)]
struct LogResponse {
    count: usize,
    events: Vec<EventEnvelope>,
}

impl LogResponse {
    fn new(events: Vec<EventEnvelope>) -> Self {
        Self {
            count: events.len(),
            events,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
