//! Health, metrics and status endpoints
//!
//! - `/healthz` - Liveness: Is the process alive?
//! - `/readyz` - Readiness: Has a configuration reached the data plane?
//! - `/metrics` - Prometheus text exposition
//! - `/status` - Reconciler state and the last applied artifact as JSON

use crate::controller::{ReconcilerHandle, ReconcilerState};
use crate::server::SharedMetrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state for readiness tracking
///
/// The controller flips this once the first configuration is live.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    /// Create a new readiness state (initially not ready)
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the HTTP handlers read from
#[derive(Clone)]
pub struct ServerState {
    pub readiness: ReadinessState,
    pub metrics: SharedMetrics,
    pub reconciler: Option<ReconcilerHandle>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: Option<ReconcilerState>,
    pub ready: bool,
    pub checksum: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub hosts: Vec<String>,
}

impl StatusReport {
    fn from_state(state: &ServerState) -> Self {
        let handle = state.reconciler.as_ref();
        let applied = handle.and_then(|h| h.last_applied());
        Self {
            state: handle.map(|h| h.state()),
            ready: state.readiness.is_ready(),
            checksum: applied.as_ref().map(|a| a.artifact.checksum().to_string()),
            applied_at: applied.as_ref().map(|a| a.applied_at),
            hosts: applied
                .as_ref()
                .map(|a| a.artifact.hosts().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Returns 200 OK if ready, 503 Service Unavailable if not.
async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ServerState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn status(State(state): State<ServerState>) -> Json<StatusReport> {
    Json(StatusReport::from_state(&state))
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Run the health server on the specified port
///
/// Runs until the listener fails.
pub async fn run_health_server(port: u16, state: ServerState) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - server is actually listening
    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
