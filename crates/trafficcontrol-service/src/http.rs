//! Health and status HTTP endpoints.
//!
//! A minimal surface for probes and operators; the full dashboard is a
//! separate deployment concern.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use trafficcontrol_chat::StatusSource;
use trafficcontrol_orchestration::Orchestrator;

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct DashboardState {
    /// The running orchestrator.
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    running: bool,
    degraded: bool,
    paused: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    summary: String,
    tasks: String,
}

/// Build the router serving `/health` and `/status`.
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health(State(state): State<DashboardState>) -> Json<HealthResponse> {
    let loop_state = state.orchestrator.state();
    Json(HealthResponse {
        status: if loop_state.running { "ok" } else { "stopped" },
        version: env!("CARGO_PKG_VERSION"),
        running: loop_state.running,
        degraded: loop_state.degraded,
        paused: loop_state.paused,
    })
}

async fn status(State(state): State<DashboardState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        summary: state.orchestrator.status_text().await,
        tasks: state.orchestrator.tasks_text().await,
    })
}

/// Serve the dashboard until `cancel` fires.
pub async fn serve(port: u16, state: DashboardState, cancel: CancellationToken) {
    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr, "dashboard listener could not bind");
            return;
        }
    };
    info!(addr, "dashboard listening");
    let shutdown = async move { cancel.cancelled().await };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(%err, "dashboard server error");
    }
}
