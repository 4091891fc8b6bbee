//! Data Transfer Objects
//!
//! Request and response types for the HTTP endpoints.
//! These types are serialized/deserialized to/from JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Principal;

// ============================================
// ROOM DTOs
// ============================================

/// Event pushed into a room by another service (combat engine, tools)
#[derive(Debug, Deserialize)]
pub struct RoomBroadcastRequest {
    /// Room-scoped frame type, e.g. `combat_update`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Room broadcast acknowledgement
#[derive(Debug, Serialize)]
pub struct RoomBroadcastResponse {
    pub room: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Room membership listing
#[derive(Debug, Serialize)]
pub struct RoomMembersResponse {
    pub room: String,
    pub count: usize,
    pub members: Vec<Principal>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: healthy, draining
    pub status: String,
    /// Registered WebSocket connections
    pub connections: usize,
    /// Non-empty rooms
    pub rooms: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
