//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (hub accepting connections)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;
use crate::websocket::HubState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Kubernetes readiness probe. Turns 503 as soon as shutdown begins so load
/// balancers stop sending new sessions.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.hub.state() {
        HubState::Running => StatusCode::OK,
        HubState::Draining | HubState::ForceClosing => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /health
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = match state.hub.state() {
        HubState::Running => "healthy",
        HubState::Draining | HubState::ForceClosing => "draining",
    };

    Json(HealthResponse {
        status: status.to_string(),
        connections: state.hub.connection_count().await,
        rooms: state.hub.room_count().await,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
