//! WebSocket Handler
//!
//! Handles the HTTP upgrade request and hands the socket to the connection
//! lifecycle.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;

use super::connection::serve_socket;
use super::hub::HubState;
use crate::api::AppState;

/// Query string accepted on `/ws`
#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    /// Room to join when the auth frame does not name one
    pub room: Option<String>,
}

/// WebSocket upgrade handler
///
/// Browser origins are checked here, before the upgrade. Requests without an
/// `Origin` header come from non-browser clients and are let through.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(origin) = headers.get(ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !state.server.origin_allowed(origin) {
            tracing::warn!(origin = %origin, "Rejected WebSocket upgrade from disallowed origin");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    if state.hub.state() != HubState::Running {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let ctx = state.session_context();
    ws.max_message_size(ctx.config.max_message_bytes)
        .on_upgrade(move |socket| serve_socket(socket, ctx, query.room))
}
