//! HTTP surface: inline SSE builds, async enqueue, status queries.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::queue::WorkerPool;
use crate::runtime::Services;
use api::{AppState, SharedState};

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Serve until Ctrl-C, then stop accepting requests, cancel in-flight
/// inline builds and hand active jobs back to the queue.
pub async fn start_server(services: Services) -> Result<()> {
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(
        services.queue.clone(),
        services.orchestrator.clone(),
        services.config.queue.workers,
        shutdown.child_token(),
    );

    let mut app = build_router(Arc::new(AppState::new(&services, shutdown.clone())));
    if services.config.server.dev_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", services.config.server.host, services.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, workers = pool.size(), "BuildForge listening");

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await
        .context("Server error");

    shutdown.cancel();
    pool.shutdown().await;
    services.close().await;
    info!("Server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl-C handler; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
