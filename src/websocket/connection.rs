//! Connection Lifecycle
//!
//! Drives one upgraded socket from handshake to close. After admission the
//! socket is split between two tasks:
//!
//! - the **writer** is the only task that writes to the socket. It drains the
//!   connection's outbound queue and sends keep-alive pings. When the hub
//!   closes the queue it sends a close frame and exits.
//! - the **reader** parses inbound frames and hands each one to the router on
//!   its own task, so a slow handler never blocks keep-alives.
//!
//! Whichever finishes first ends the connection; the connection is then
//! unregistered exactly once.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{timeout, Instant};

use super::handshake::{self, HandshakeParams};
use super::hub::{Hub, HubState};
use super::messages::{Frame, HandshakeMessage, InboundFrame, OutboundText};
use super::router::{Caller, MessageRouter};
use crate::auth::CredentialValidator;

/// Timing and size limits for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed between upgrade and a valid auth frame
    pub handshake_timeout: Duration,
    /// Close the connection after this long without any inbound frame
    pub idle_timeout: Duration,
    /// Writer sends a ping this often; must be below `idle_timeout`
    pub ping_interval: Duration,
    /// Upper bound on a single socket write
    pub write_timeout: Duration,
    /// Largest inbound message accepted
    pub max_message_bytes: usize,
    /// Requests a single connection may have dispatched at once
    pub max_in_flight: usize,
    /// Accept the upgrade's `?room=` when the auth frame names none
    pub allow_room_fallback: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 64 * 1024,
            max_in_flight: 8,
            allow_room_fallback: true,
        }
    }
}

/// Shared services a connection needs
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Hub,
    pub router: Arc<MessageRouter>,
    pub validator: Arc<dyn CredentialValidator>,
    pub config: ConnectionConfig,
}

/// Serve an upgraded socket until either side goes away
pub async fn serve_socket(mut socket: WebSocket, ctx: SessionContext, query_room: Option<String>) {
    let params = HandshakeParams {
        timeout: ctx.config.handshake_timeout,
        fallback_room: query_room.as_deref(),
        allow_room_fallback: ctx.config.allow_room_fallback,
    };

    // Rejections are logged and answered inside the handshake
    let validator = ctx.validator.as_ref();
    let Ok(admission) = handshake::perform(&mut socket, validator, params).await else {
        return;
    };

    if admission.room_source == handshake::RoomSource::Query {
        tracing::debug!(
            user_id = %admission.principal.user_id,
            room = %admission.room,
            room_source = admission.room_source.as_str(),
            "Room taken from upgrade query"
        );
    }

    let principal = Arc::new(admission.principal);
    let (conn, outbound) = ctx
        .hub
        .new_connection(Arc::clone(&principal), admission.room.clone());
    let id = conn.id.clone();
    let session = conn.session;

    if let Err(e) = ctx.hub.register(conn).await {
        tracing::warn!(connection_id = %id, error = %e, "Registration refused");
        handshake::reject(&mut socket, &e.to_string()).await;
        return;
    }

    // Written directly so it precedes anything already queued for us
    let sent = match HandshakeMessage::success(&principal, &admission.room).to_text() {
        Ok(text) => timeout(ctx.config.write_timeout, socket.send(Message::Text(text)))
            .await
            .map_or(false, |r| r.is_ok()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize auth_success");
            false
        }
    };
    if !sent {
        ctx.hub.unregister(&id, session).await;
        return;
    }

    let caller = Caller {
        id: id.clone(),
        principal,
        room: admission.room,
    };

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(
        sink,
        outbound,
        ctx.config.clone(),
        id.clone(),
    ));
    let mut reader = tokio::spawn(read_pump(stream, caller, ctx.clone()));

    let writer_done = tokio::select! {
        _ = &mut writer => {
            reader.abort();
            true
        }
        _ = &mut reader => false,
    };

    // Dropping our queue lets a still-running writer send its close frame
    ctx.hub.unregister(&id, session).await;

    if !writer_done && timeout(ctx.config.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::debug!(connection_id = %id, session, "Connection finished");
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundText>,
    config: ConnectionConfig,
    id: String,
) {
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let message = tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => Message::Text(text.to_string()),
                // Unregistered, replaced, evicted or shutting down
                None => break,
            },
            _ = keepalive.tick() => Message::Ping(Vec::new()),
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %id, error = %e, "WebSocket send failed");
                break;
            }
            Err(_) => {
                tracing::warn!(connection_id = %id, "WebSocket write timed out");
                break;
            }
        }
    }

    // Always the writer's last act: close the socket
    let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    let _ = timeout(config.write_timeout, sink.close()).await;
}

async fn read_pump(mut stream: SplitStream<WebSocket>, caller: Caller, ctx: SessionContext) {
    let force_close = force_closed(ctx.hub.subscribe_state());
    tokio::pin!(force_close);
    let in_flight = Arc::new(Semaphore::new(ctx.config.max_in_flight));

    loop {
        let next = tokio::select! {
            _ = &mut force_close => {
                tracing::debug!(connection_id = %caller.id, "Force-closing reader");
                return;
            }
            next = timeout(ctx.config.idle_timeout, stream.next()) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %caller.id, error = %e, "WebSocket receive error");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::info!(
                    connection_id = %caller.id,
                    idle_secs = ctx.config.idle_timeout.as_secs(),
                    "Closing idle connection"
                );
                return;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => match Arc::clone(&in_flight).try_acquire_owned() {
                    Ok(permit) => {
                        let router = Arc::clone(&ctx.router);
                        let caller = caller.clone();
                        tokio::spawn(async move {
                            router.dispatch(&caller, frame).await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        tracing::warn!(
                            connection_id = %caller.id,
                            message_type = %frame.kind,
                            "Too many requests in flight"
                        );
                        let frame = Frame::error(frame.request_id, "too many requests in flight");
                        let _ = ctx.hub.send_to(&caller.id, &frame).await;
                    }
                },
                Err(e) => {
                    tracing::debug!(
                        connection_id = %caller.id,
                        error = %e,
                        "Invalid client message"
                    );
                    let frame = Frame::error(None, format!("Invalid message format: {e}"));
                    let _ = ctx.hub.send_to(&caller.id, &frame).await;
                }
            },
            Message::Binary(_) => {
                let frame = Frame::error(None, "Binary messages not supported");
                let _ = ctx.hub.send_to(&caller.id, &frame).await;
            }
            // Any inbound traffic resets the idle timer
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                tracing::debug!(connection_id = %caller.id, "Client requested close");
                return;
            }
        }
    }
}

/// Resolves once the hub enters force-close, or the hub goes away
async fn force_closed(mut state: watch::Receiver<HubState>) {
    loop {
        if *state.borrow_and_update() == HubState::ForceClosing {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
