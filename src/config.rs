//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::Role;
use crate::websocket::{ConnectionConfig, HubConfig, RouterConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub connection: ConnectionSection,

    #[serde(default)]
    pub router: RouterSection,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP / upgrade endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed to open a WebSocket (browser clients)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Accept upgrades from any origin (local development only)
    #[serde(default)]
    pub relaxed_handshake: bool,

    /// Use the `?room=` query parameter when the auth frame omits a room
    #[serde(default = "default_true")]
    pub allow_room_fallback: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            relaxed_handshake: false,
            allow_room_fallback: true,
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a browser `Origin` header may open a session
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.relaxed_handshake || self.allowed_origins.iter().any(|o| o == origin)
    }
}

/// Hub registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-connection outbound queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Capacity of the hub's command queue
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Broadcast `user_joined` / `user_left` to rooms
    #[serde(default = "default_true")]
    pub presence_events: bool,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    1024
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            queue_capacity: default_queue_capacity(),
            command_capacity: default_command_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            presence_events: true,
        }
    }
}

/// Per-connection timing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    54
}

fn default_write_timeout() -> u64 {
    10
}

fn default_max_message_bytes() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_in_flight() -> usize {
    8
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            ping_interval_secs: default_ping_interval(),
            write_timeout_secs: default_write_timeout(),
            max_message_bytes: default_max_message_bytes(),
            max_in_flight_requests: default_max_in_flight(),
        }
    }
}

/// Message router configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
}

fn default_handler_timeout() -> u64 {
    120
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout(),
        }
    }
}

/// How bearer tokens are validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Token table in this file
    #[default]
    Static,
    /// Ask the credential issuer
    Remote,
}

/// Credential validation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,

    pub issuer_url: Option<String>,

    #[serde(default = "default_auth_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

fn default_auth_timeout() -> u64 {
    3000
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            issuer_url: None,
            request_timeout_ms: default_auth_timeout(),
            tokens: Vec::new(),
        }
    }
}

/// Static token entry (`[[auth.tokens]]`)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

/// Content generator service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    pub url: Option<String>,

    #[serde(default = "default_generator_timeout")]
    pub request_timeout_ms: u64,
}

fn default_generator_timeout() -> u64 {
    90_000
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: default_generator_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tablehub").join("config.toml")),
            Some(PathBuf::from("/etc/tablehub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "hub.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.hub.command_capacity == 0 {
            return Err(ConfigError::Invalid(
                "hub.command_capacity must be greater than zero".to_string(),
            ));
        }
        if self.connection.ping_interval_secs == 0
            || self.connection.ping_interval_secs >= self.connection.idle_timeout_secs
        {
            return Err(ConfigError::Invalid(format!(
                "connection.ping_interval_secs ({}) must be non-zero and below idle_timeout_secs ({})",
                self.connection.ping_interval_secs, self.connection.idle_timeout_secs
            )));
        }
        if self.connection.max_in_flight_requests == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_in_flight_requests must be greater than zero".to_string(),
            ));
        }
        if self.auth.mode == AuthMode::Remote && self.auth.issuer_url.is_none() {
            return Err(ConfigError::Invalid(
                "auth.issuer_url is required when auth.mode = \"remote\"".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.hub.max_connections,
            queue_capacity: self.hub.queue_capacity,
            command_capacity: self.hub.command_capacity,
            presence_events: self.hub.presence_events,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: Duration::from_secs(self.connection.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(self.connection.idle_timeout_secs),
            ping_interval: Duration::from_secs(self.connection.ping_interval_secs),
            write_timeout: Duration::from_secs(self.connection.write_timeout_secs),
            max_message_bytes: self.connection.max_message_bytes,
            max_in_flight: self.connection.max_in_flight_requests,
            allow_room_fallback: self.server.allow_room_fallback,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            handler_timeout: Duration::from_secs(self.router.handler_timeout_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.shutdown_timeout_secs)
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(host) = std::env::var("TABLEHUB_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TABLEHUB_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(origins) = std::env::var("TABLEHUB_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Ok(relaxed) = std::env::var("TABLEHUB_RELAXED_HANDSHAKE") {
            self.server.relaxed_handshake = relaxed.eq_ignore_ascii_case("true") || relaxed == "1";
        }

        // Collaborator overrides
        if let Ok(url) = std::env::var("TABLEHUB_AUTH_ISSUER_URL") {
            self.auth.issuer_url = Some(url);
            self.auth.mode = AuthMode::Remote;
        }
        if let Ok(url) = std::env::var("TABLEHUB_GENERATOR_URL") {
            self.generator.url = Some(url);
        }

        // Logging overrides
        if let Ok(level) = std::env::var("TABLEHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TABLEHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Tablehub Configuration
#
# Environment variables override these settings:
# - TABLEHUB_HOST
# - TABLEHUB_PORT
# - TABLEHUB_ALLOWED_ORIGINS (comma-separated)
# - TABLEHUB_RELAXED_HANDSHAKE
# - TABLEHUB_AUTH_ISSUER_URL (switches auth.mode to "remote")
# - TABLEHUB_GENERATOR_URL
# - TABLEHUB_LOG_LEVEL
# - TABLEHUB_LOG_FORMAT

[server]
host = "0.0.0.0"
port = 8090

# Browser origins allowed to open a session socket
allowed_origins = ["http://localhost:5173", "http://127.0.0.1:5173"]

# Accept any origin. Local development only.
relaxed_handshake = false

# Fall back to the ?room= query parameter when the auth frame has no room
allow_room_fallback = true

[hub]
max_connections = 10000

# Frames buffered per connection before it is dropped as a slow consumer
queue_capacity = 256

command_capacity = 1024

# Seconds to wait for connections to drain on shutdown
shutdown_timeout_secs = 10

# Broadcast user_joined / user_left to rooms
presence_events = true

[connection]
handshake_timeout_secs = 30
idle_timeout_secs = 60
ping_interval_secs = 54
write_timeout_secs = 10
max_message_bytes = 65536
# Requests one connection may have running at once
max_in_flight_requests = 8

[router]
handler_timeout_secs = 120

[auth]
# "static" (token table below) or "remote" (credential issuer)
mode = "static"
# issuer_url = "http://localhost:8081"
request_timeout_ms = 3000

# [[auth.tokens]]
# token = "dev-dm-token"
# user_id = "dm-1"
# display_name = "Game Master"
# role = "dm"

[generator]
# url = "http://localhost:8070"
request_timeout_ms = 90000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
