//! Message Router
//!
//! Dispatch table from inbound frame `type` to handler, plus the framing of
//! correlated responses.
//!
//! Every inbound request with a known or unknown type gets exactly one
//! terminal frame (`complete: true`) back. Streaming routes first send an
//! interim frame, handlers may push partial frames while they work, and the
//! router alone sends the terminal frame once the handler returns.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::hub::{ConnectionId, Hub, HubError, RoomId};
use super::messages::{Frame, InboundFrame};
use crate::auth::{Principal, Role};
use crate::generation::{GenerationError, ProgressSink};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(120),
        }
    }
}

/// The connection a request arrived on
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: ConnectionId,
    pub principal: Arc<Principal>,
    pub room: RoomId,
}

/// Everything a handler gets to work with
pub struct Request<'a> {
    pub caller: &'a Caller,
    pub request_id: Option<&'a str>,
    pub data: Value,
    pub hub: &'a Hub,
    /// Sends partial results to the requester
    pub progress: &'a Responder,
}

/// Trait implemented by every message handler
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce the terminal result for one request
    async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError>;
}

/// One dispatch table entry
#[derive(Clone)]
pub struct Route {
    /// Minimum role, checked before the handler runs
    pub required_role: Option<Role>,
    /// Send an interim frame before running the handler
    pub streaming: bool,
    /// `type` of the frames answering this request
    pub response_type: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl Route {
    pub fn new(response_type: impl Into<String>, handler: impl MessageHandler + 'static) -> Self {
        Self {
            required_role: None,
            streaming: false,
            response_type: response_type.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn require(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

/// Sends non-terminal frames for one in-flight request
pub struct Responder {
    hub: Hub,
    target: ConnectionId,
    response_type: String,
    request_id: Option<String>,
}

impl Responder {
    fn new(
        hub: Hub,
        target: ConnectionId,
        response_type: &str,
        request_id: Option<String>,
    ) -> Self {
        Self {
            hub,
            target,
            response_type: response_type.to_string(),
            request_id,
        }
    }

    /// Push a `streaming: true, complete: false` frame to the requester
    pub async fn send_partial(&self, data: Value) {
        let frame = Frame::partial(&self.response_type, self.request_id.clone(), data);
        if let Err(e) = self.hub.send_to(&self.target, &frame).await {
            tracing::debug!(connection_id = %self.target, error = %e, "Dropped partial frame");
        }
    }
}

#[async_trait]
impl ProgressSink for Responder {
    async fn partial(&self, data: Value) {
        self.send_partial(data).await;
    }
}

/// Routes inbound frames to handlers
pub struct MessageRouter {
    routes: HashMap<String, Route>,
    hub: Hub,
    config: RouterConfig,
}

impl MessageRouter {
    /// Create an empty router
    pub fn new(hub: Hub, config: RouterConfig) -> Self {
        Self {
            routes: HashMap::new(),
            hub,
            config,
        }
    }

    /// Register a route for a message type
    pub fn register(&mut self, message_type: &str, route: Route) {
        self.routes.insert(message_type.to_string(), route);
    }

    /// List all registered message types (sorted)
    pub fn message_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_route(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Handle one inbound frame, answering the caller through the hub
    pub async fn dispatch(&self, caller: &Caller, frame: InboundFrame) {
        let InboundFrame {
            kind,
            request_id,
            data,
        } = frame;

        tracing::debug!(
            connection_id = %caller.id,
            room = %caller.room,
            message_type = %kind,
            request_id = ?request_id,
            "Dispatching message"
        );

        let Some(route) = self.routes.get(&kind) else {
            tracing::debug!(
                connection_id = %caller.id,
                message_type = %kind,
                "Unknown message type"
            );
            let frame = Frame::error(request_id, format!("unknown message type: {kind}"));
            self.reply(caller, &frame).await;
            return;
        };

        if let Some(required) = route.required_role {
            if !caller.principal.has_role(required) {
                tracing::warn!(
                    connection_id = %caller.id,
                    message_type = %kind,
                    role = %caller.principal.role,
                    required = %required,
                    "Role check failed"
                );
                let frame = Frame::error(request_id, required.denial_message());
                self.reply(caller, &frame).await;
                return;
            }
        }

        let responder = Responder::new(
            self.hub.clone(),
            caller.id.clone(),
            &route.response_type,
            request_id.clone(),
        );
        if route.streaming {
            responder.send_partial(json!({ "status": "processing" })).await;
        }

        let request = Request {
            caller,
            request_id: request_id.as_deref(),
            data,
            hub: &self.hub,
            progress: &responder,
        };

        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(self.config.handler_timeout, route.handler.handle(request)).await;

        let terminal = match outcome {
            Ok(Ok(result)) => Frame::terminal(&route.response_type, request_id, result),
            Ok(Err(e)) => {
                tracing::warn!(
                    connection_id = %caller.id,
                    message_type = %kind,
                    error = %e,
                    "Handler failed"
                );
                Frame::error(request_id, e.to_string())
            }
            Err(_elapsed) => {
                tracing::error!(
                    connection_id = %caller.id,
                    message_type = %kind,
                    "Handler timed out after {:?}",
                    self.config.handler_timeout
                );
                Frame::error(request_id, format!("{kind} timed out"))
            }
        };

        tracing::debug!(
            connection_id = %caller.id,
            message_type = %kind,
            duration_ms = started.elapsed().as_millis() as u64,
            "Request complete"
        );

        self.reply(caller, &terminal).await;
    }

    async fn reply(&self, caller: &Caller, frame: &Frame) {
        if let Err(e) = self.hub.send_to(&caller.id, frame).await {
            tracing::error!(connection_id = %caller.id, error = %e, "Failed to queue response");
        }
    }
}

/// Errors a handler can report; each becomes a terminal error frame
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Generation(#[from] GenerationError),

    #[error("{0}")]
    Hub(#[from] HubError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::hub::HubConfig;
    use crate::websocket::messages::OutboundText;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError> {
            Ok(request.data)
        }
    }

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            request
                .hub
                .broadcast(&request.caller.room, &Frame::event("secret", Value::Null))
                .await?;
            Ok(Value::Null)
        }
    }

    struct ChunkingHandler;

    #[async_trait]
    impl MessageHandler for ChunkingHandler {
        async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError> {
            request.progress.send_partial(json!({"chunk": "Once"})).await;
            request.progress.send_partial(json!({"chunk": "upon"})).await;
            Ok(json!({"text": "Once upon"}))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _request: Request<'_>) -> Result<Value, HandlerError> {
            Err(GenerationError::Unavailable.into())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _request: Request<'_>) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    async fn join(
        hub: &Hub,
        id: &str,
        role: Role,
        room: &str,
    ) -> (Caller, mpsc::Receiver<OutboundText>) {
        let principal = Arc::new(Principal::new(id, id, role));
        let (conn, rx) = hub.new_connection(Arc::clone(&principal), room);
        hub.register(conn).await.unwrap();
        let caller = Caller {
            id: id.to_string(),
            principal,
            room: room.to_string(),
        };
        (caller, rx)
    }

    async fn frames(hub: &Hub, rx: &mut mpsc::Receiver<OutboundText>) -> Vec<Frame> {
        hub.connection_count().await; // barrier
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn inbound(json: &str) -> InboundFrame {
        serde_json::from_str(json).unwrap()
    }

    fn quiet_hub() -> Hub {
        Hub::spawn(HubConfig {
            presence_events: false,
            ..HubConfig::default()
        })
    }

    #[tokio::test]
    async fn test_dispatch_echo() {
        let hub = quiet_hub();
        let mut router = MessageRouter::new(hub.clone(), RouterConfig::default());
        router.register("echo", Route::new("echo_reply", EchoHandler));
        let (caller, mut rx) = join(&hub, "u1", Role::Player, "S1").await;

        router
            .dispatch(&caller, inbound(r#"{"type":"echo","requestId":"r1","data":{"x":1}}"#))
            .await;

        let got = frames(&hub, &mut rx).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, "echo_reply");
        assert_eq!(got[0].request_id.as_deref(), Some("r1"));
        assert_eq!(got[0].data["x"], 1);
        assert!(got[0].complete);
    }

    #[tokio::test]
    async fn test_unknown_type_is_correlated_error() {
        let hub = quiet_hub();
        let router = MessageRouter::new(hub.clone(), RouterConfig::default());
        let (caller, mut rx) = join(&hub, "u1", Role::Player, "S1").await;

        router
            .dispatch(&caller, inbound(r#"{"type":"teleport","requestId":"r7"}"#))
            .await;

        let got = frames(&hub, &mut rx).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, "error");
        assert_eq!(got[0].request_id.as_deref(), Some("r7"));
        assert_eq!(got[0].error.as_deref(), Some("unknown message type: teleport"));
    }

    #[tokio::test]
    async fn test_role_check_precedes_handler() {
        let hub = quiet_hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = MessageRouter::new(hub.clone(), RouterConfig::default());
        router.register(
            "dm_assistant_request",
            Route::new("dm_assistant", CountingHandler(Arc::clone(&calls)))
                .require(Role::Dm)
                .streaming(),
        );
        let (player, mut rx_player) = join(&hub, "p1", Role::Player, "S1").await;
        let (_other, mut rx_other) = join(&hub, "p2", Role::Player, "S1").await;

        router
            .dispatch(
                &player,
                inbound(r#"{"type":"dm_assistant_request","requestId":"r1"}"#),
            )
            .await;

        let got = frames(&hub, &mut rx_player).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, "error");
        assert_eq!(got[0].request_id.as_deref(), Some("r1"));
        assert_eq!(got[0].error.as_deref(), Some("DM privileges required"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(frames(&hub, &mut rx_other).await.is_empty());
        // Connection stays registered
        assert_eq!(hub.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_admin_satisfies_dm_route() {
        let hub = quiet_hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = MessageRouter::new(hub.clone(), RouterConfig::default());
        router.register(
            "dm_only",
            Route::new("dm_only_done", CountingHandler(Arc::clone(&calls))).require(Role::Dm),
        );
        let (admin, mut rx) = join(&hub, "a1", Role::Admin, "S1").await;

        router
            .dispatch(&admin, inbound(r#"{"type":"dm_only","requestId":"r2"}"#))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let got = frames(&hub, &mut rx).await;
        // Room broadcast from the handler, then the terminal reply
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, "secret");
        assert_eq!(got[1].kind, "dm_only_done");
    }

    #[tokio::test]
    async fn test_streaming_terminal_is_last_and_unique() {
        let hub = quiet_hub();
        let mut router = MessageRouter::new(hub.clone(), RouterConfig::default());
        router.register("story", Route::new("story", ChunkingHandler).streaming());
        let (caller, mut rx) = join(&hub, "u1", Role::Player, "S1").await;

        router
            .dispatch(&caller, inbound(r#"{"type":"story","requestId":"r3"}"#))
            .await;

        let got = frames(&hub, &mut rx).await;
        assert_eq!(got.len(), 4);
        assert!(got.iter().all(|f| f.request_id.as_deref() == Some("r3")));
        assert_eq!(got[0].data["status"], "processing");
        assert!(got[..3].iter().all(|f| f.streaming && !f.complete));
        assert_eq!(got.iter().filter(|f| f.complete).count(), 1);
        assert!(got[3].complete);
        assert_eq!(got[3].data["text"], "Once upon");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_terminal_error() {
        let hub = quiet_hub();
        let mut router = MessageRouter::new(hub.clone(), RouterConfig::default());
        router.register("gen", Route::new("gen", FailingHandler).streaming());
        let (caller, mut rx) = join(&hub, "u1", Role::Player, "S1").await;

        router
            .dispatch(&caller, inbound(r#"{"type":"gen","requestId":"r4"}"#))
            .await;

        let got = frames(&hub, &mut rx).await;
        assert_eq!(got.len(), 2);
        assert!(got[0].streaming);
        assert_eq!(got[1].kind, "error");
        assert_eq!(got[1].request_id.as_deref(), Some("r4"));
        assert_eq!(got[1].error.as_deref(), Some("content generation unavailable"));
    }

    #[tokio::test]
    async fn test_handler_timeout() {
        let hub = quiet_hub();
        let mut router = MessageRouter::new(
            hub.clone(),
            RouterConfig {
                handler_timeout: Duration::from_millis(100),
            },
        );
        router.register("slow", Route::new("slow", SlowHandler));
        let (caller, mut rx) = join(&hub, "u1", Role::Player, "S1").await;

        router
            .dispatch(&caller, inbound(r#"{"type":"slow","requestId":"r5"}"#))
            .await;

        let got = frames(&hub, &mut rx).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].error.as_deref(), Some("slow timed out"));
    }

    #[tokio::test]
    async fn test_message_types_sorted() {
        let mut router = MessageRouter::new(quiet_hub(), RouterConfig::default());
        router.register("b", Route::new("b", EchoHandler));
        router.register("a", Route::new("a", EchoHandler));
        assert_eq!(router.message_types(), vec!["a", "b"]);
        assert!(router.has_route("a"));
        assert!(!router.has_route("c"));
    }
}
