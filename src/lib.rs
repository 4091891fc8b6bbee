//! # tablehub
//!
//! Real-time session hub for tabletop games. Authenticated players and DMs
//! join a session room over WebSocket; the hub fans room events out to every
//! member and routes typed requests (narration, NPC dialogue, locations...)
//! to handlers that stream their results back.
//!
//! ## Modules
//!
//! - [`websocket`]: handshake, connection pumps, hub actor, message router
//! - [`auth`]: roles, principals, credential validators
//! - [`generation`]: content generator collaborators
//! - [`api`]: HTTP surface with Axum (upgrade, room routes, health)
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tablehub::auth::{Principal, Role};
//! use tablehub::websocket::{Frame, Hub, HubConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Hub::spawn(HubConfig::default());
//!
//!     let dm = Arc::new(Principal::new("u1", "Mira", Role::Dm));
//!     let (conn, mut outbound) = hub.new_connection(dm, "S1");
//!     hub.register(conn).await?;
//!
//!     hub.broadcast("S1", &Frame::event("combat_update", serde_json::json!({"round": 1})))
//!         .await?;
//!     while let Ok(text) = outbound.try_recv() {
//!         println!("{text}");
//!     }
//!
//!     hub.shutdown(std::time::Duration::from_secs(1)).await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod generation;
pub mod websocket;

// Re-export top-level types for convenience
pub use api::{build_router, serve, serve_on, ApiError, AppState};

pub use auth::{
    AuthError, CredentialValidator, Principal, RemoteValidator, Role, StaticTokenValidator,
};

pub use generation::{
    ContentGenerator, ContentKind, GenerationError, GenerationRequest, HttpContentGenerator,
    ProgressSink, UnconfiguredGenerator,
};

pub use websocket::{
    websocket_handler, ConnectionConfig, Frame, Hub, HubConfig, HubError, HubState,
    MessageHandler, MessageRouter, Route, RouterConfig, ShutdownReport,
};

pub use config::{AuthMode, Config, ConfigError, LoggingConfig};
