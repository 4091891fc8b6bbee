//! Application State
//!
//! Shared state accessible by all HTTP handlers and upgraded sockets.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::CredentialValidator;
use crate::config::{Config, ServerConfig};
use crate::generation::ContentGenerator;
use crate::websocket::{register_defaults, ConnectionConfig, Hub, MessageRouter, SessionContext};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Registry and broadcaster for every live connection
    pub hub: Hub,
    /// Dispatch table for steady-state frames
    pub router: Arc<MessageRouter>,
    /// Validates handshake tokens and HTTP bearer tokens
    pub validator: Arc<dyn CredentialValidator>,
    pub server: Arc<ServerConfig>,
    pub connection: ConnectionConfig,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        hub: Hub,
        router: MessageRouter,
        validator: Arc<dyn CredentialValidator>,
        server: ServerConfig,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            hub,
            router: Arc::new(router),
            validator,
            server: Arc::new(server),
            connection,
            start_time: Instant::now(),
        }
    }

    /// Spawn the hub and build the default dispatch table
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(
        config: &Config,
        validator: Arc<dyn CredentialValidator>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        let hub = Hub::spawn(config.hub_config());
        let mut router = MessageRouter::new(hub.clone(), config.router_config());
        register_defaults(&mut router, generator);

        Self::new(
            hub,
            router,
            validator,
            config.server.clone(),
            config.connection_config(),
        )
    }

    /// Services handed to each upgraded socket
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            hub: self.hub.clone(),
            router: Arc::clone(&self.router),
            validator: Arc::clone(&self.validator),
            config: self.connection.clone(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
