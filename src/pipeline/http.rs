//! Health and metrics HTTP surface
//!
//! The core is a server component; operators see it through `/health`,
//! `/ready`, and the Prometheus `/metrics` endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Result, StreamError};
use crate::metrics::Metrics;
use crate::pipeline::storage::StorageManager;

#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub storage: Arc<StorageManager>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
}

/// Serve until the shutdown signal flips
pub async fn serve(port: u16, state: HttpState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| StreamError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("HTTP surface listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| StreamError::Config(format!("http server error: {}", e)))?;

    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::VERSION,
    })
}

async fn ready(State(state): State<HttpState>) -> impl IntoResponse {
    let ready = state.storage.health_check().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready }))
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    let families = state.metrics.registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        )
            .into_response(),
    }
}
