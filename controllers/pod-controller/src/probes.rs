//! Health, readiness and metrics endpoints.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared state of the probe server.
#[derive(Clone)]
pub struct ProbeState {
    ready: ReadinessCheck,
    registry: Registry,
}

impl ProbeState {
    /// `ready` is polled by `/readyz`; `registry` is exported on `/metrics`.
    pub fn new<F>(ready: F, registry: Registry) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            ready: Arc::new(ready),
            registry,
        }
    }
}

impl fmt::Debug for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeState").finish_non_exhaustive()
    }
}

/// Builds the probe router.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if (state.ready)() {
        (StatusCode::OK, Json(HealthResponse { status: "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "syncing" }),
        )
    }
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.registry.gather()) {
        Ok(body) => {
            let headers = [(header::CONTENT_TYPE, encoder.format_type().to_string())];
            (headers, body).into_response()
        }
        Err(e) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            (status, e.to_string()).into_response()
        }
    }
}

/// Serves the probes on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ProbeState,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
