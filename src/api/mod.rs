//! tablehub HTTP Surface
//!
//! HTTP layer for tablehub, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /ws[?room=<session>]` - Game session connection
//!
//! ## Rooms
//! - `POST /api/v1/rooms/:room/broadcast` - Push an event to a room
//! - `GET /api/v1/rooms/:room` - List room members
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use tablehub::api::{serve, AppState};
//! use tablehub::auth::StaticTokenValidator;
//! use tablehub::config::Config;
//! use tablehub::generation::UnconfiguredGenerator;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let validator = Arc::new(StaticTokenValidator::from_entries(&config.auth.tokens));
//!     let state = AppState::from_config(&config, validator, Arc::new(UnconfiguredGenerator));
//!     serve(state, &config).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::{Config, ServerConfig};
use crate::websocket::{websocket_handler, ShutdownReport};

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.connection.max_message_bytes;

    let api_routes = Router::new()
        .route("/rooms/:room", get(routes::rooms::get_room))
        .route("/rooms/:room/broadcast", post(routes::rooms::broadcast_to_room))
        .layer(DefaultBodyLimit::max(body_limit));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(&state.server);
    let shared_state = Arc::new(state);

    Router::new()
        .route("/ws", get(websocket_handler))
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    if server.relaxed_handshake {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring unparseable allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Start the server and run until SIGINT/SIGTERM
pub async fn serve(state: AppState, config: &Config) -> Result<ShutdownReport, ApiError> {
    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("tablehub listening on {}", addr);

    serve_on(listener, state, config.shutdown_timeout(), shutdown_signal()).await
}

/// Serve on a bound listener until `signal` resolves
///
/// Once the signal fires the hub starts draining immediately, in parallel
/// with the HTTP server refusing new requests.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    shutdown_timeout: Duration,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<ShutdownReport, ApiError> {
    let hub = state.hub.clone();
    let router = build_router(state);

    let (report_tx, report_rx) = oneshot::channel();
    let drain_hub = hub.clone();
    let shutdown = async move {
        signal.await;
        tokio::spawn(async move {
            let report = drain_hub.shutdown(shutdown_timeout).await;
            let _ = report_tx.send(report);
        });
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    // The server can also stop without a signal, e.g. if the listener fails
    let report = match report_rx.await {
        Ok(report) => report,
        Err(_) => hub.shutdown(shutdown_timeout).await,
    };

    tracing::info!(
        drained = report.drained,
        remaining = report.remaining,
        "tablehub shut down"
    );
    Ok(report)
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Principal, Role, StaticTokenValidator};
    use crate::generation::UnconfiguredGenerator;
    use crate::websocket::OutboundText;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    fn create_test_state() -> AppState {
        let mut config = Config::default();
        config.hub.presence_events = false;
        let validator = StaticTokenValidator::new()
            .with_token("dm-token", Principal::new("dm1", "Mira", Role::Dm))
            .with_token("player-token", Principal::new("p1", "Tam", Role::Player));
        AppState::from_config(&config, Arc::new(validator), Arc::new(UnconfiguredGenerator))
    }

    async fn join(state: &AppState, id: &str, room: &str) -> mpsc::Receiver<OutboundText> {
        let principal = Arc::new(Principal::new(id, id, Role::Player));
        let (conn, rx) = state.hub.new_connection(principal, room);
        state.hub.register(conn).await.unwrap();
        rx
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn broadcast(room: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/rooms/{room}/broadcast"))
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health_live() {
        let app = build_router(create_test_state());
        let response = app.oneshot(get("/health/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready_flips_on_shutdown() {
        let state = create_test_state();
        let hub = state.hub.clone();
        let app = build_router(state);

        let response = app.clone().oneshot(get("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report = hub.shutdown(Duration::from_secs(1)).await;
        assert!(report.drained);

        let response = app.oneshot(get("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_full() {
        let state = create_test_state();
        let _rx = join(&state, "u1", "S1").await;
        let app = build_router(state);

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connections"], 1);
        assert_eq!(json["rooms"], 1);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_broadcast_requires_token() {
        let app = build_router(create_test_state());
        let response = app
            .oneshot(broadcast("S1", None, r#"{"type":"combat_update"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let app = build_router(create_test_state());
        let response = app
            .oneshot(broadcast("S1", Some("bogus"), r#"{"type":"combat_update"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_broadcast_requires_dm() {
        let app = build_router(create_test_state());
        let response = app
            .oneshot(broadcast("S1", Some("player-token"), r#"{"type":"combat_update"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room_only() {
        let state = create_test_state();
        let mut rx_s1 = join(&state, "a", "S1").await;
        let mut rx_s2 = join(&state, "b", "S2").await;
        let hub = state.hub.clone();
        let app = build_router(state);

        let response = app
            .oneshot(broadcast(
                "S1",
                Some("dm-token"),
                r#"{"type":"combat_update","data":{"round":2}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["room"], "S1");
        assert_eq!(json["type"], "combat_update");

        hub.connection_count().await;
        let text = rx_s1.try_recv().unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "combat_update");
        assert_eq!(frame["data"]["round"], 2);
        assert!(frame.get("requestId").is_none());
        assert!(rx_s2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_rejects_reserved_type() {
        let app = build_router(create_test_state());
        let response = app
            .oneshot(broadcast("S1", Some("dm-token"), r#"{"type":"auth_success"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_room_members() {
        let state = create_test_state();
        let _rx_a = join(&state, "a", "S1").await;
        let _rx_b = join(&state, "b", "S1").await;
        let app = build_router(state);

        let request = Request::builder()
            .uri("/api/v1/rooms/S1")
            .header("Authorization", "Bearer dm-token")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["count"], 2);
        assert_eq!(json["members"][0]["userId"], "a");
    }
}
