//! Room Routes
//!
//! Lets trusted services reach connected clients without holding a socket.
//!
//! - POST /api/v1/rooms/:room/broadcast - Push an event to every member
//! - GET /api/v1/rooms/:room - List the members of a room
//!
//! Both require `Authorization: Bearer <token>` for a principal with at least
//! the `dm` role.

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{RoomBroadcastRequest, RoomBroadcastResponse, RoomMembersResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{Principal, Role};
use crate::websocket::handshake::is_valid_room;
use crate::websocket::messages::ERROR_TYPE;
use crate::websocket::Frame;

/// Frame types reserved for the protocol itself
const RESERVED_TYPES: &[&str] = &[ERROR_TYPE, "auth", "auth_required", "auth_success"];

/// POST /api/v1/rooms/:room/broadcast
pub async fn broadcast_to_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RoomBroadcastRequest>,
) -> ApiResult<(StatusCode, Json<RoomBroadcastResponse>)> {
    let principal = authorize(&state, &headers, Role::Dm).await?;
    check_room(&room)?;

    let kind = request.kind.trim();
    if kind.is_empty() {
        return Err(ApiError::Validation("type must not be empty".to_string()));
    }
    if RESERVED_TYPES.contains(&kind) {
        return Err(ApiError::Validation(format!("type '{kind}' is reserved")));
    }

    state
        .hub
        .broadcast(&room, &Frame::event(kind, request.data))
        .await?;

    tracing::info!(
        room = %room,
        message_type = %kind,
        user_id = %principal.user_id,
        "Room event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(RoomBroadcastResponse {
            room,
            kind: kind.to_string(),
        }),
    ))
}

/// GET /api/v1/rooms/:room
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RoomMembersResponse>> {
    authorize(&state, &headers, Role::Dm).await?;
    check_room(&room)?;

    let members = state.hub.room_members(&room).await;

    Ok(Json(RoomMembersResponse {
        room,
        count: members.len(),
        members,
    }))
}

/// Validate the bearer token and enforce a minimum role
async fn authorize(state: &AppState, headers: &HeaderMap, required: Role) -> ApiResult<Principal> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("bearer token required".to_string()))?;

    let principal = state.validator.validate(token).await?;
    if !principal.has_role(required) {
        tracing::warn!(
            user_id = %principal.user_id,
            role = %principal.role,
            required = %required,
            "HTTP role check failed"
        );
        return Err(ApiError::Forbidden(required.denial_message().to_string()));
    }

    Ok(principal)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn check_room(room: &str) -> ApiResult<()> {
    if is_valid_room(room) {
        Ok(())
    } else {
        Err(ApiError::Validation("invalid room id".to_string()))
    }
}
