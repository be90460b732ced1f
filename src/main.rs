//! Two-phase-commit monitor - live view of a distributed transaction
//!
//! Connects to the coordinator's event stream, follows every participant it
//! registers, and serves the resulting dashboard over HTTP.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use twopc_monitor::channel::SseTransport;
use twopc_monitor::config::Settings;
use twopc_monitor::events::EventEnvelope;
use twopc_monitor::metrics::MetricsServer;
use twopc_monitor::{api, MonitorEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(settings.logging.json);

    info!("Starting 2PC Monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Following coordinator at {}", settings.monitor.coordinator_url);

    // Initialize monitor engine
    let transport = Arc::new(SseTransport::new()?);
    let engine = Arc::new(MonitorEngine::new(settings.monitor.clone(), transport)?);
    engine.observe_all(Arc::new(audit_event)).await;
    info!("Monitor engine initialized");

    // Start API server
    let api_handle = if settings.api.enabled {
        let config = settings.api.clone();
        let engine = engine.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start monitor engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Monitor engine error: {}", e);
            }
        }
    });

    info!("2PC Monitor is running");
    if settings.api.enabled {
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;
    if let Err(e) = engine_handle.await {
        warn!("Monitor engine task ended abnormally: {}", e);
    }

    // Abort background tasks
    for handle in [api_handle, metrics_handle].into_iter().flatten() {
        handle.abort();
    }

    info!("2PC Monitor stopped");
    Ok(())
}

/// Audit trail of every decoded envelope
fn audit_event(envelope: &EventEnvelope) {
    info!(
        target: "audit",
        source = %envelope.source_name,
        event = %envelope.kind,
        at = %envelope.timestamp.to_rfc3339(),
        payload = %envelope.payload,
        "event"
    );
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,twopc_monitor=debug,hyper=warn,reqwest=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
