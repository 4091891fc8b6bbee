//! WebSocket Session Hub
//!
//! Real-time fan-out between game clients in the same session room.
//!
//! ## Architecture
//!
//! - **Handshake**: token + room exchanged in the first frame after upgrade
//! - **Connection**: per-socket reader and writer tasks
//! - **Hub**: single actor owning the registry of connections and rooms
//! - **Router**: dispatch table from frame `type` to handler, with role checks
//!   and correlated streaming responses
//! - **Messages**: wire formats
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:8090/ws');
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   if (msg.type === 'auth_required') {
//!     ws.send(JSON.stringify({type: 'auth', token, room: 'S1'}));
//!   } else if (msg.type === 'auth_success') {
//!     ws.send(JSON.stringify({type: 'narration_request', requestId: 'r1', data: {}}));
//!   }
//! };
//! ```

mod connection;
mod handler;
pub mod handlers;
pub mod handshake;
mod hub;
pub mod messages;
mod router;

pub use connection::{serve_socket, ConnectionConfig, SessionContext};
pub use handler::{websocket_handler, UpgradeQuery};
pub use handlers::register_defaults;
pub use hub::{
    ConnectionHandle, ConnectionId, Hub, HubConfig, HubError, HubState, RoomId, ShutdownReport,
};
pub use messages::{Frame, InboundFrame, OutboundText};
pub use router::{
    Caller, HandlerError, MessageHandler, MessageRouter, Request, Responder, Route, RouterConfig,
};
