//! Authentication
//!
//! Principals, roles, and the credential validator seam. Tokens are minted by an
//! external issuer; this crate only asks "who does this token belong to?".
//!
//! - [`StaticTokenValidator`]: token table loaded from config (development, tests)
//! - [`RemoteValidator`]: asks the credential issuer over HTTP

mod validator;

pub use validator::{RemoteValidator, StaticTokenValidator};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Privilege level of a principal
///
/// Ordered: `Player < Dm < Admin`. A required role is satisfied by any role at
/// or above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Dm,
    Admin,
}

impl Role {
    /// Whether this role grants at least the privileges of `required`
    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Dm => "dm",
            Role::Admin => "admin",
        }
    }

    /// Message sent back when a principal lacks this role
    pub fn denial_message(self) -> &'static str {
        match self {
            Role::Player => "player privileges required",
            Role::Dm => "DM privileges required",
            Role::Admin => "admin privileges required",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "player" => Ok(Role::Player),
            "dm" => Ok(Role::Dm),
            "admin" => Ok(Role::Admin),
            other => Err(AuthError::InvalidRole(other.to_string())),
        }
    }
}

/// Authenticated identity bound to a connection
///
/// Built once during the handshake and never mutated afterwards, so it is
/// shared as `Arc<Principal>` without further synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn has_role(&self, required: Role) -> bool {
        self.role.satisfies(required)
    }
}

/// Verifies bearer tokens issued by the credential service
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Resolve a token to the principal it was issued for
    async fn validate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Errors that can occur while validating credentials
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("unknown role: {0}")]
    InvalidRole(String),

    #[error("credential issuer unavailable")]
    Unavailable,

    #[error("credential issuer error ({status}): {message}")]
    Issuer { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
}
