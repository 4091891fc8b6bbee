//! WebSocket Message Types
//!
//! Defines the handshake frames and the steady-state [`Frame`] envelope
//! exchanged between game clients and the hub.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{Principal, Role};

/// Serialized frame as queued for a connection's writer
///
/// Broadcasts serialize once and share the text across every queue.
pub type OutboundText = Arc<str>;

/// Frame type used for every error response
pub const ERROR_TYPE: &str = "error";

/// Steady-state frame sent from server to client
///
/// A `request_id` correlates zero or more `streaming` frames with exactly one
/// `complete` frame. Room broadcasts carry no request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(default)]
    pub streaming: bool,

    #[serde(default)]
    pub complete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    /// Room-scoped event with no correlation
    pub fn event(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            data,
            streaming: false,
            complete: true,
            error: None,
        }
    }

    /// Non-terminal frame for an in-flight request
    pub fn partial(kind: impl Into<String>, request_id: Option<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id,
            data,
            streaming: true,
            complete: false,
            error: None,
        }
    }

    /// Terminal success frame for a request
    pub fn terminal(kind: impl Into<String>, request_id: Option<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id,
            data,
            streaming: false,
            complete: true,
            error: None,
        }
    }

    /// Terminal error frame, correlated when `request_id` is known
    pub fn error(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ERROR_TYPE.to_string(),
            request_id,
            data: Value::Null,
            streaming: false,
            complete: true,
            error: Some(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.complete
    }

    /// Serialize once for queueing
    pub fn to_text(&self) -> Result<OutboundText, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// Frame received from a client after the handshake
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub request_id: Option<String>,

    #[serde(default)]
    pub data: Value,
}

/// Frame the client must send first: `{"type":"auth","token":..,"room":..}`
///
/// Fields are optional at the serde level so a malformed frame can be
/// rejected with a precise reason.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthFrame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub room: Option<String>,
}

/// Frames the server sends during the handshake
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Sent immediately after upgrade
    AuthRequired,
    /// Sent once the token is accepted
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        user_id: String,
        username: String,
        role: Role,
        room: String,
    },
    /// Sent before closing a rejected socket
    Error { error: String },
}

impl HandshakeMessage {
    pub fn success(principal: &Principal, room: &str) -> Self {
        HandshakeMessage::AuthSuccess {
            user_id: principal.user_id.clone(),
            username: principal.display_name.clone(),
            role: principal.role,
            room: room.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        HandshakeMessage::Error {
            error: message.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
