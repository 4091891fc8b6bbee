//! WebSocket Connection Hub
//!
//! Sole owner of room membership and fan-out. The registry lives inside a
//! single actor task; every other task talks to it through a cloneable [`Hub`]
//! handle that submits commands over a bounded queue. Nothing outside the
//! actor ever touches the registry, so no locks guard it.
//!
//! Delivery to a connection is a non-blocking `try_send` into its bounded
//! outbound queue. A full queue evicts that connection instead of waiting, so
//! one slow consumer never stalls the rest of its room.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::messages::{Frame, OutboundText};
use crate::auth::Principal;

/// Unique identifier for a connection (the principal's user id)
pub type ConnectionId = String;

/// Game session identifier
pub type RoomId = String;

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue
    pub queue_capacity: usize,
    /// Capacity of the hub's command queue
    pub command_capacity: usize,
    /// Broadcast `user_joined` / `user_left` to rooms
    pub presence_events: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            queue_capacity: 256,
            command_capacity: 1024,
            presence_events: true,
        }
    }
}

/// Lifecycle of the hub, published to every handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Accepting registrations
    Running,
    /// Shutdown started; queues closed, waiting for connections to unregister
    Draining,
    /// Shutdown deadline elapsed; readers must exit immediately
    ForceClosing,
}

/// Result of [`Hub::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every connection unregistered before the deadline
    pub drained: bool,
    /// Connections still registered when the call returned
    pub remaining: usize,
}

/// Registration ticket for one authenticated connection
///
/// Owns the producing side of the connection's outbound queue. Once handed to
/// [`Hub::register`] only the hub can enqueue to it.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Process-unique number distinguishing reconnects with the same id
    pub session: u64,
    pub principal: Arc<Principal>,
    pub room: RoomId,
    sender: mpsc::Sender<OutboundText>,
}

enum HubCommand {
    Register {
        conn: ConnectionHandle,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: ConnectionId,
        session: u64,
    },
    SendTo {
        id: ConnectionId,
        text: OutboundText,
    },
    Broadcast {
        room: RoomId,
        text: OutboundText,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
    RoomMembers {
        room: RoomId,
        reply: oneshot::Sender<Vec<Principal>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    ForceClose,
}

/// Handle to the hub actor
///
/// Cheap to clone; inject it into anything that needs to reach connections.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    state: watch::Receiver<HubState>,
    config: Arc<HubConfig>,
    next_session: Arc<AtomicU64>,
}

impl Hub {
    /// Start the hub actor on the current tokio runtime
    pub fn spawn(config: HubConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state) = watch::channel(HubState::Running);

        let registry = Registry {
            connections: HashMap::new(),
            rooms: HashMap::new(),
            config: config.clone(),
            state: state_tx,
            drain_waiters: Vec::new(),
        };
        tokio::spawn(registry.run(rx));

        Self {
            commands,
            state,
            config: Arc::new(config),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create the bounded outbound queue for a new connection
    ///
    /// The returned receiver belongs to the connection's writer.
    pub fn new_connection(
        &self,
        principal: Arc<Principal>,
        room: impl Into<RoomId>,
    ) -> (ConnectionHandle, mpsc::Receiver<OutboundText>) {
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let handle = ConnectionHandle {
            id: principal.user_id.clone(),
            session: self.next_session.fetch_add(1, Ordering::Relaxed),
            principal,
            room: room.into(),
            sender,
        };
        (handle, receiver)
    }

    /// Admit a connection to its room
    ///
    /// Replaces any existing entry with the same id, closing the old queue.
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Register { conn, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Remove a connection; a no-op if it is already gone or was replaced
    pub async fn unregister(&self, id: &str, session: u64) {
        let _ = self
            .submit(HubCommand::Unregister {
                id: id.to_string(),
                session,
            })
            .await;
    }

    /// Deliver a frame to a single connection, if it is still registered
    pub async fn send_to(&self, id: &str, frame: &Frame) -> Result<(), HubError> {
        let text = frame.to_text()?;
        self.submit(HubCommand::SendTo {
            id: id.to_string(),
            text,
        })
        .await
    }

    /// Deliver a frame to every connection in a room
    pub async fn broadcast(&self, room: &str, frame: &Frame) -> Result<(), HubError> {
        let text = frame.to_text()?;
        self.submit(HubCommand::Broadcast {
            room: room.to_string(),
            text,
        })
        .await
    }

    /// Get the current connection count
    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.submit(HubCommand::ConnectionCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Number of non-empty rooms
    pub async fn room_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.submit(HubCommand::RoomCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Principals currently connected to a room
    pub async fn room_members(&self, room: &str) -> Vec<Principal> {
        let (reply, rx) = oneshot::channel();
        let cmd = HubCommand::RoomMembers {
            room: room.to_string(),
            reply,
        };
        if self.submit(cmd).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions (readers use this to honour force-close)
    pub fn subscribe_state(&self) -> watch::Receiver<HubState> {
        self.state.clone()
    }

    /// Stop accepting registrations and drain every connection
    ///
    /// Closes every outbound queue so each writer exits and closes its socket.
    /// Returns once all connections have unregistered or `deadline` elapses;
    /// in the latter case remaining readers are told to exit immediately.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let (reply, rx) = oneshot::channel();
        if self.submit(HubCommand::Shutdown { reply }).await.is_err() {
            return ShutdownReport {
                drained: true,
                remaining: 0,
            };
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(_) => {
                tracing::info!("Hub drained all connections");
                ShutdownReport {
                    drained: true,
                    remaining: 0,
                }
            }
            Err(_) => {
                let _ = self.submit(HubCommand::ForceClose).await;
                let remaining = self.connection_count().await;
                tracing::warn!(remaining, "Hub shutdown deadline elapsed, force-closing");
                ShutdownReport {
                    drained: false,
                    remaining,
                }
            }
        }
    }

    async fn submit(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.commands.send(cmd).await.map_err(|_| HubError::Closed)
    }
}

/// Registry entry for one admitted connection
struct Entry {
    session: u64,
    principal: Arc<Principal>,
    room: RoomId,
    /// `None` once the queue has been closed by shutdown
    sender: Option<mpsc::Sender<OutboundText>>,
}

/// State owned exclusively by the hub actor
struct Registry {
    connections: HashMap<ConnectionId, Entry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    config: HubConfig,
    state: watch::Sender<HubState>,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl Registry {
    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                HubCommand::Register { conn, reply } => {
                    let result = self.register(conn);
                    let _ = reply.send(result);
                }
                HubCommand::Unregister { id, session } => self.unregister(&id, session),
                HubCommand::SendTo { id, text } => self.send_to(&id, text),
                HubCommand::Broadcast { room, text } => self.broadcast(&room, text),
                HubCommand::ConnectionCount { reply } => {
                    let _ = reply.send(self.connections.len());
                }
                HubCommand::RoomCount { reply } => {
                    let _ = reply.send(self.rooms.len());
                }
                HubCommand::RoomMembers { room, reply } => {
                    let _ = reply.send(self.members(&room));
                }
                HubCommand::Shutdown { reply } => self.begin_shutdown(reply),
                HubCommand::ForceClose => {
                    self.state.send_replace(HubState::ForceClosing);
                }
            }
        }

        tracing::debug!("Hub actor stopped");
    }

    fn register(&mut self, conn: ConnectionHandle) -> Result<(), HubError> {
        if *self.state.borrow() != HubState::Running {
            return Err(HubError::ShuttingDown);
        }

        let replaced = self.connections.contains_key(&conn.id);
        if replaced {
            // Fast reconnect: close the old queue before admitting the new one
            if let Some(old) = self.detach(&conn.id) {
                tracing::info!(
                    connection_id = %conn.id,
                    old_session = old.session,
                    new_session = conn.session,
                    "Replacing existing connection"
                );
                if old.room != conn.room {
                    self.announce_left(&conn.id, &old);
                }
            }
        } else if self.connections.len() >= self.config.max_connections {
            return Err(HubError::TooManyConnections(self.config.max_connections));
        }

        let ConnectionHandle {
            id,
            session,
            principal,
            room,
            sender,
        } = conn;

        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(id.clone());
        self.connections.insert(
            id.clone(),
            Entry {
                session,
                principal: Arc::clone(&principal),
                room: room.clone(),
                sender: Some(sender),
            },
        );

        tracing::info!(
            connection_id = %id,
            room = %room,
            role = %principal.role,
            "WebSocket connected"
        );

        if self.config.presence_events {
            let frame = Frame::event(
                "user_joined",
                json!({
                    "userId": principal.user_id,
                    "username": principal.display_name,
                    "role": principal.role,
                    "at": chrono::Utc::now().to_rfc3339(),
                }),
            );
            self.broadcast_frame(&room, &frame);
        }

        Ok(())
    }

    fn unregister(&mut self, id: &str, session: u64) {
        match self.connections.get(id) {
            Some(entry) if entry.session == session => {}
            // Already gone, or replaced by a newer session with the same id
            _ => return,
        }

        if let Some(entry) = self.detach(id) {
            tracing::info!(connection_id = %id, room = %entry.room, "WebSocket disconnected");
            self.announce_left(id, &entry);
        }
        self.notify_if_drained();
    }

    fn send_to(&mut self, id: &str, text: OutboundText) {
        let delivered = match self.connections.get(id) {
            Some(entry) => try_enqueue(entry, text),
            None => return,
        };

        if let Err(reason) = delivered {
            self.evict(id, reason);
        }
    }

    fn broadcast(&mut self, room: &str, text: OutboundText) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };

        let mut failed = Vec::new();
        let mut sent = 0usize;
        for id in members {
            if let Some(entry) = self.connections.get(id) {
                match try_enqueue(entry, Arc::clone(&text)) {
                    Ok(()) => sent += 1,
                    Err(reason) => failed.push((id.clone(), reason)),
                }
            }
        }

        tracing::trace!(room = %room, recipients = sent, dropped = failed.len(), "Broadcast frame");

        for (id, reason) in failed {
            self.evict(&id, reason);
        }
    }

    fn broadcast_frame(&mut self, room: &str, frame: &Frame) {
        match frame.to_text() {
            Ok(text) => self.broadcast(room, text),
            Err(e) => tracing::error!(error = %e, "Failed to serialize hub event"),
        }
    }

    /// Drop a connection whose queue rejected a frame
    fn evict(&mut self, id: &str, reason: DropReason) {
        if let Some(entry) = self.detach(id) {
            match reason {
                DropReason::QueueFull => tracing::warn!(
                    connection_id = %id,
                    room = %entry.room,
                    "Outbound queue full, dropping slow connection"
                ),
                DropReason::QueueClosed => tracing::debug!(
                    connection_id = %id,
                    room = %entry.room,
                    "Outbound queue closed, dropping connection"
                ),
            }
            self.announce_left(id, &entry);
        }
        self.notify_if_drained();
    }

    /// Remove an entry from both maps; dropping it closes its queue
    fn detach(&mut self, id: &str) -> Option<Entry> {
        let entry = self.connections.remove(id)?;
        if let Some(members) = self.rooms.get_mut(&entry.room) {
            members.remove(id);
            if members.is_empty() {
                self.rooms.remove(&entry.room);
            }
        }
        Some(entry)
    }

    fn announce_left(&mut self, id: &str, entry: &Entry) {
        if !self.config.presence_events || *self.state.borrow() != HubState::Running {
            return;
        }
        let frame = Frame::event(
            "user_left",
            json!({
                "userId": id,
                "username": entry.principal.display_name,
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        );
        self.broadcast_frame(&entry.room, &frame);
    }

    fn members(&self, room: &str) -> Vec<Principal> {
        let mut members: Vec<Principal> = self
            .rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .map(|entry| (*entry.principal).clone())
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if *self.state.borrow() == HubState::Running {
            self.state.send_replace(HubState::Draining);
            tracing::info!(
                connections = self.connections.len(),
                "Hub shutting down, closing outbound queues"
            );
        }

        // Closing every queue makes each writer exit and close its socket;
        // entries stay until their reader unregisters.
        for entry in self.connections.values_mut() {
            entry.sender = None;
        }

        self.drain_waiters.push(reply);
        self.notify_if_drained();
    }

    fn notify_if_drained(&mut self) {
        if self.connections.is_empty() && *self.state.borrow() != HubState::Running {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DropReason {
    QueueFull,
    QueueClosed,
}

fn try_enqueue(entry: &Entry, text: OutboundText) -> Result<(), DropReason> {
    let Some(sender) = &entry.sender else {
        // Shutdown already closed this queue; the connection is on its way out
        return Ok(());
    };
    sender.try_send(text).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => DropReason::QueueFull,
        mpsc::error::TrySendError::Closed(_) => DropReason::QueueClosed,
    })
}

/// Errors that can occur in the connection hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Hub is not running")]
    Closed,

    #[error("Failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}
