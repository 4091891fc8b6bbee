//! Handshake Protocol
//!
//! Runs immediately after upgrade, before a connection is admitted to the hub.
//! Browsers cannot attach headers to a WebSocket upgrade, so the bearer token
//! travels in the first application frame instead:
//!
//! ```text
//! server: {"type":"auth_required"}
//! client: {"type":"auth","token":"…","room":"…"}
//! server: {"type":"auth_success",…}   or   {"type":"error","error":"…"} + close
//! ```

use axum::extract::ws::{Message, WebSocket};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::messages::{AuthFrame, HandshakeMessage};
use crate::auth::{AuthError, CredentialValidator, Principal};

/// Longest accepted room identifier
const MAX_ROOM_LEN: usize = 128;

/// Progress of a single handshake; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingAuth,
    Authenticated,
    Rejected,
}

/// Where the bound room id came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomSource {
    /// The auth frame named the room
    AuthFrame,
    /// Pre-upgrade `?room=` query parameter
    Query,
}

impl RoomSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomSource::AuthFrame => "auth_frame",
            RoomSource::Query => "query",
        }
    }
}

/// Successful handshake result
#[derive(Debug, Clone)]
pub struct Admission {
    pub principal: Principal,
    pub room: String,
    pub room_source: RoomSource,
}

/// Inputs that shape a handshake
#[derive(Debug, Clone)]
pub struct HandshakeParams<'a> {
    pub timeout: Duration,
    /// Room from the upgrade request's query string
    pub fallback_room: Option<&'a str>,
    pub allow_room_fallback: bool,
}

/// Reasons a handshake is rejected
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("authentication timed out")]
    Timeout,

    #[error("connection closed during handshake")]
    Closed,

    #[error("expected auth message, got {0}")]
    UnexpectedType(String),

    #[error("binary frames are not accepted during handshake")]
    Binary,

    #[error("malformed auth message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("auth token required")]
    MissingToken,

    #[error("room required")]
    MissingRoom,

    #[error("invalid room id")]
    InvalidRoom,

    #[error("authentication failed")]
    Auth(#[from] AuthError),

    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

impl HandshakeError {
    /// Text shown to the client in the error frame
    ///
    /// Credential issuer details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            HandshakeError::Auth(AuthError::InvalidToken) => "invalid token".to_string(),
            HandshakeError::Auth(_) => "authentication failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Run the handshake on a freshly upgraded socket
///
/// On failure the error frame has already been sent and the socket closed;
/// the caller just drops it. Nothing is registered either way.
pub async fn perform(
    socket: &mut WebSocket,
    validator: &dyn CredentialValidator,
    params: HandshakeParams<'_>,
) -> Result<Admission, HandshakeError> {
    let mut state = HandshakeState::AwaitingAuth;
    tracing::trace!(?state, "Starting handshake");

    match negotiate(socket, validator, &params).await {
        Ok(admission) => {
            state = HandshakeState::Authenticated;
            tracing::debug!(
                ?state,
                user_id = %admission.principal.user_id,
                room = %admission.room,
                room_source = admission.room_source.as_str(),
                "Handshake complete"
            );
            Ok(admission)
        }
        Err(e) => {
            state = HandshakeState::Rejected;
            tracing::warn!(?state, error = %e, "Handshake rejected");
            reject(socket, &e.client_message()).await;
            Err(e)
        }
    }
}

/// Send an error frame and close the socket, ignoring transport failures
pub async fn reject(socket: &mut WebSocket, message: &str) {
    if let Ok(text) = HandshakeMessage::error(message).to_text() {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn negotiate(
    socket: &mut WebSocket,
    validator: &dyn CredentialValidator,
    params: &HandshakeParams<'_>,
) -> Result<Admission, HandshakeError> {
    let deadline = Instant::now() + params.timeout;

    let prompt = HandshakeMessage::AuthRequired.to_text()?;
    socket.send(Message::Text(prompt)).await?;

    let text = read_auth_text(socket, deadline).await?;
    let frame: AuthFrame = serde_json::from_str(&text)?;
    let (token, room, room_source) = check_auth_frame(frame, params)?;

    // Validation shares the handshake deadline
    let principal = tokio::time::timeout_at(deadline, validator.validate(&token))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    Ok(Admission {
        principal,
        room,
        room_source,
    })
}

/// Wait for the first text frame, skipping keep-alive control frames
async fn read_auth_text(
    socket: &mut WebSocket,
    deadline: Instant,
) -> Result<String, HandshakeError> {
    loop {
        let next = tokio::time::timeout_at(deadline, socket.recv())
            .await
            .map_err(|_| HandshakeError::Timeout)?;

        match next {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => return Err(HandshakeError::Binary),
            Some(Ok(Message::Close(_))) | None => return Err(HandshakeError::Closed),
            Some(Err(e)) => return Err(HandshakeError::Transport(e)),
        }
    }
}

/// Validate the shape of the auth frame and resolve the room
fn check_auth_frame(
    frame: AuthFrame,
    params: &HandshakeParams<'_>,
) -> Result<(String, String, RoomSource), HandshakeError> {
    if frame.kind != "auth" {
        return Err(HandshakeError::UnexpectedType(frame.kind));
    }

    let token = frame
        .token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(HandshakeError::MissingToken)?;

    let from_frame = frame
        .room
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    let (room, source) = match from_frame {
        Some(room) => (room, RoomSource::AuthFrame),
        None => {
            let fallback = params
                .fallback_room
                .filter(|_| params.allow_room_fallback)
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or(HandshakeError::MissingRoom)?;
            (fallback.to_string(), RoomSource::Query)
        }
    };

    if !is_valid_room(&room) {
        return Err(HandshakeError::InvalidRoom);
    }

    Ok((token, room, source))
}

/// Room ids are short opaque tokens: alphanumerics plus `-_:.`
pub fn is_valid_room(room: &str) -> bool {
    !room.is_empty()
        && room.len() <= MAX_ROOM_LEN
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(fallback: Option<&str>) -> HandshakeParams<'_> {
        HandshakeParams {
            timeout: Duration::from_secs(30),
            fallback_room: fallback,
            allow_room_fallback: true,
        }
    }

    fn frame(json: &str) -> AuthFrame {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_auth_frame_room_is_authoritative() {
        let (token, room, source) = check_auth_frame(
            frame(r#"{"type":"auth","token":"t","room":"S1"}"#),
            &params(Some("S9")),
        )
        .unwrap();
        assert_eq!(token, "t");
        assert_eq!(room, "S1");
        assert_eq!(source, RoomSource::AuthFrame);
    }

    #[test]
    fn test_room_falls_back_to_query() {
        let (_, room, source) =
            check_auth_frame(frame(r#"{"type":"auth","token":"t"}"#), &params(Some("S9"))).unwrap();
        assert_eq!(room, "S9");
        assert_eq!(source, RoomSource::Query);
    }

    #[test]
    fn test_fallback_can_be_disabled() {
        let p = HandshakeParams {
            allow_room_fallback: false,
            ..params(Some("S9"))
        };
        let result = check_auth_frame(frame(r#"{"type":"auth","token":"t"}"#), &p);
        assert!(matches!(result, Err(HandshakeError::MissingRoom)));
    }

    #[test]
    fn test_rejects_wrong_type() {
        let result = check_auth_frame(
            frame(r#"{"type":"hello","token":"t","room":"S1"}"#),
            &params(None),
        );
        assert!(matches!(result, Err(HandshakeError::UnexpectedType(t)) if t == "hello"));
    }

    #[test]
    fn test_rejects_empty_token_and_room() {
        let result = check_auth_frame(
            frame(r#"{"type":"auth","token":"  ","room":"S1"}"#),
            &params(None),
        );
        assert!(matches!(result, Err(HandshakeError::MissingToken)));

        let result = check_auth_frame(
            frame(r#"{"type":"auth","token":"t","room":""}"#),
            &params(None),
        );
        assert!(matches!(result, Err(HandshakeError::MissingRoom)));
    }

    #[test]
    fn test_rejects_invalid_room() {
        let result = check_auth_frame(
            frame(r#"{"type":"auth","token":"t","room":"../etc"}"#),
            &params(None),
        );
        assert!(matches!(result, Err(HandshakeError::InvalidRoom)));
    }

    #[test]
    fn test_valid_rooms() {
        assert!(is_valid_room("S1"));
        assert!(is_valid_room("campaign-42:session_7.b"));
        assert!(!is_valid_room(""));
        assert!(!is_valid_room("has space"));
        assert!(!is_valid_room(&"x".repeat(MAX_ROOM_LEN + 1)));
    }

    #[test]
    fn test_client_message_hides_issuer_details() {
        let err = HandshakeError::Auth(AuthError::Issuer {
            status: 500,
            message: "db down".to_string(),
        });
        assert_eq!(err.client_message(), "authentication failed");
        let err = HandshakeError::Auth(AuthError::InvalidToken);
        assert_eq!(err.client_message(), "invalid token");
    }
}
