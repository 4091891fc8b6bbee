//! Built-in message handlers
//!
//! [`register_defaults`] populates a [`MessageRouter`] with the message types
//! game clients use.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::messages::Frame;
use super::router::{HandlerError, MessageHandler, MessageRouter, Request, Route};
use crate::auth::Role;
use crate::generation::{ContentGenerator, ContentKind, GenerationRequest};

/// Register every built-in route
pub fn register_defaults(router: &mut MessageRouter, generator: Arc<dyn ContentGenerator>) {
    router.register("ping", Route::new("pong", PingHandler));
    router.register("room_members", Route::new("room_members", RoomMembersHandler));
    router.register(
        "dm_announcement",
        Route::new("dm_announcement_sent", AnnouncementHandler).require(Role::Dm),
    );

    let generation_routes = [
        (
            "generate_location",
            "location_generated",
            ContentKind::Location,
            Some(Role::Dm),
            Some("location_revealed"),
        ),
        ("npc_dialogue_request", "npc_dialogue", ContentKind::NpcDialogue, None, None),
        (
            "narration_request",
            "narration",
            ContentKind::Narration,
            Some(Role::Dm),
            Some("narration"),
        ),
        ("plot_twist_request", "plot_twist", ContentKind::PlotTwist, Some(Role::Dm), None),
        ("hazard_request", "hazard", ContentKind::Hazard, Some(Role::Dm), None),
        ("dm_assistant_request", "dm_assistant", ContentKind::DmAssistant, Some(Role::Dm), None),
    ];

    for (message_type, response_type, kind, role, reveal) in generation_routes {
        let handler = GenerationHandler {
            kind,
            generator: Arc::clone(&generator),
            reveal_as: reveal,
        };
        let mut route = Route::new(response_type, handler).streaming();
        if let Some(role) = role {
            route = route.require(role);
        }
        router.register(message_type, route);
    }
}

/// Application-level keep-alive
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _request: Request<'_>) -> Result<Value, HandlerError> {
        Ok(json!({ "time": chrono::Utc::now().to_rfc3339() }))
    }
}

/// Lists who is connected to the caller's room
pub struct RoomMembersHandler;

#[async_trait]
impl MessageHandler for RoomMembersHandler {
    async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError> {
        let members = request.hub.room_members(&request.caller.room).await;
        Ok(json!({
            "room": request.caller.room,
            "members": members,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct AnnouncementData {
    text: String,
}

/// DM-only text pushed to everyone in the room
pub struct AnnouncementHandler;

#[async_trait]
impl MessageHandler for AnnouncementHandler {
    async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError> {
        let data: AnnouncementData = serde_json::from_value(request.data)
            .map_err(|e| HandlerError::InvalidRequest(e.to_string()))?;
        let text = data.text.trim();
        if text.is_empty() {
            return Err(HandlerError::InvalidRequest("text must not be empty".to_string()));
        }

        let frame = Frame::event(
            "dm_announcement",
            json!({
                "text": text,
                "from": request.caller.principal.display_name,
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        );
        request.hub.broadcast(&request.caller.room, &frame).await?;

        Ok(json!({ "room": request.caller.room, "delivered": true }))
    }
}

/// Runs a content generator and optionally reveals the result to the room
pub struct GenerationHandler {
    pub kind: ContentKind,
    pub generator: Arc<dyn ContentGenerator>,
    /// Room event type used to reveal the result, if any
    pub reveal_as: Option<&'static str>,
}

#[async_trait]
impl MessageHandler for GenerationHandler {
    async fn handle(&self, request: Request<'_>) -> Result<Value, HandlerError> {
        let job = GenerationRequest {
            kind: self.kind,
            room: request.caller.room.clone(),
            requested_by: request.caller.id.clone(),
            request: request.data,
        };

        let content = self.generator.generate(job, request.progress).await?;

        if let Some(event) = self.reveal_as {
            let frame = Frame::event(
                event,
                json!({
                    "content": content,
                    "requestedBy": request.caller.principal.display_name,
                }),
            );
            request.hub.broadcast(&request.caller.room, &frame).await?;
        }

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::generation::{GenerationError, ProgressSink};
    use crate::websocket::hub::{Hub, HubConfig};
    use crate::websocket::messages::{InboundFrame, OutboundText};
    use crate::websocket::router::{Caller, RouterConfig};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records jobs and streams one chunk before answering
    #[derive(Default)]
    struct MockGenerator {
        jobs: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl ContentGenerator for MockGenerator {
        async fn generate(
            &self,
            request: GenerationRequest,
            progress: &dyn ProgressSink,
        ) -> Result<Value, GenerationError> {
            let kind = request.kind;
            self.jobs.lock().unwrap().push(request);
            progress.partial(json!({ "chunk": "..." })).await;
            Ok(json!({ "kind": kind, "name": "Whispering Fen" }))
        }
    }

    struct Fixture {
        hub: Hub,
        router: MessageRouter,
        generator: Arc<MockGenerator>,
    }

    fn fixture() -> Fixture {
        let hub = Hub::spawn(HubConfig {
            presence_events: false,
            ..HubConfig::default()
        });
        let generator = Arc::new(MockGenerator::default());
        let mut router = MessageRouter::new(hub.clone(), RouterConfig::default());
        register_defaults(&mut router, generator.clone());
        Fixture {
            hub,
            router,
            generator,
        }
    }

    async fn join(
        hub: &Hub,
        id: &str,
        role: Role,
        room: &str,
    ) -> (Caller, mpsc::Receiver<OutboundText>) {
        let principal = Arc::new(Principal::new(id, format!("{id}-name"), role));
        let (conn, rx) = hub.new_connection(Arc::clone(&principal), room);
        hub.register(conn).await.unwrap();
        (
            Caller {
                id: id.to_string(),
                principal,
                room: room.to_string(),
            },
            rx,
        )
    }

    async fn frames(hub: &Hub, rx: &mut mpsc::Receiver<OutboundText>) -> Vec<Frame> {
        hub.connection_count().await;
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn inbound(json: &str) -> InboundFrame {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_default_routes_registered() {
        let f = fixture();
        for t in [
            "ping",
            "room_members",
            "dm_announcement",
            "generate_location",
            "npc_dialogue_request",
            "narration_request",
            "plot_twist_request",
            "hazard_request",
            "dm_assistant_request",
        ] {
            assert!(f.router.has_route(t), "missing route {t}");
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let f = fixture();
        let (caller, mut rx) = join(&f.hub, "p1", Role::Player, "S1").await;
        f.router
            .dispatch(&caller, inbound(r#"{"type":"ping","requestId":"k"}"#))
            .await;
        let got = frames(&f.hub, &mut rx).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, "pong");
        assert!(got[0].data["time"].is_string());
    }

    #[tokio::test]
    async fn test_location_is_revealed_to_room() {
        let f = fixture();
        let (dm, mut rx_dm) = join(&f.hub, "dm", Role::Dm, "S1").await;
        let (_player, mut rx_player) = join(&f.hub, "p1", Role::Player, "S1").await;
        let (_stranger, mut rx_stranger) = join(&f.hub, "p9", Role::Player, "S2").await;

        f.router
            .dispatch(
                &dm,
                inbound(r#"{"type":"generate_location","requestId":"r1","data":{"biome":"swamp"}}"#),
            )
            .await;

        let dm_frames = frames(&f.hub, &mut rx_dm).await;
        let kinds: Vec<&str> = dm_frames.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "location_generated",
                "location_generated",
                "location_revealed",
                "location_generated"
            ]
        );
        let last = dm_frames.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.request_id.as_deref(), Some("r1"));
        assert_eq!(last.data["name"], "Whispering Fen");

        let player_frames = frames(&f.hub, &mut rx_player).await;
        assert_eq!(player_frames.len(), 1);
        assert_eq!(player_frames[0].kind, "location_revealed");
        assert!(player_frames[0].request_id.is_none());
        assert_eq!(player_frames[0].data["requestedBy"], "dm-name");

        assert!(frames(&f.hub, &mut rx_stranger).await.is_empty());

        let jobs = f.generator.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, ContentKind::Location);
        assert_eq!(jobs[0].room, "S1");
        assert_eq!(jobs[0].request["biome"], "swamp");
    }

    #[tokio::test]
    async fn test_npc_dialogue_open_to_players_and_private() {
        let f = fixture();
        let (player, mut rx_player) = join(&f.hub, "p1", Role::Player, "S1").await;
        let (_other, mut rx_other) = join(&f.hub, "p2", Role::Player, "S1").await;

        f.router
            .dispatch(
                &player,
                inbound(r#"{"type":"npc_dialogue_request","requestId":"r2"}"#),
            )
            .await;

        let got = frames(&f.hub, &mut rx_player).await;
        assert_eq!(got.last().unwrap().kind, "npc_dialogue");
        assert!(got.last().unwrap().complete);
        assert!(frames(&f.hub, &mut rx_other).await.is_empty());
    }

    #[tokio::test]
    async fn test_player_cannot_request_plot_twist() {
        let f = fixture();
        let (player, mut rx) = join(&f.hub, "p1", Role::Player, "S1").await;

        f.router
            .dispatch(
                &player,
                inbound(r#"{"type":"plot_twist_request","requestId":"r3"}"#),
            )
            .await;

        let got = frames(&f.hub, &mut rx).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].error.as_deref(), Some("DM privileges required"));
        assert!(f.generator.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dm_announcement() {
        let f = fixture();
        let (dm, mut rx_dm) = join(&f.hub, "dm", Role::Dm, "S1").await;
        let (_player, mut rx_player) = join(&f.hub, "p1", Role::Player, "S1").await;

        f.router
            .dispatch(
                &dm,
                inbound(r#"{"type":"dm_announcement","requestId":"a1","data":{"text":"Roll initiative!"}}"#),
            )
            .await;

        let player_frames = frames(&f.hub, &mut rx_player).await;
        assert_eq!(player_frames.len(), 1);
        assert_eq!(player_frames[0].kind, "dm_announcement");
        assert_eq!(player_frames[0].data["text"], "Roll initiative!");
        assert_eq!(player_frames[0].data["from"], "dm-name");

        let dm_frames = frames(&f.hub, &mut rx_dm).await;
        assert_eq!(dm_frames.last().unwrap().kind, "dm_announcement_sent");
    }

    #[tokio::test]
    async fn test_dm_announcement_requires_text() {
        let f = fixture();
        let (dm, mut rx) = join(&f.hub, "dm", Role::Dm, "S1").await;

        f.router
            .dispatch(
                &dm,
                inbound(r#"{"type":"dm_announcement","requestId":"a2","data":{"text":"  "}}"#),
            )
            .await;

        let got = frames(&f.hub, &mut rx).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, "error");
        assert_eq!(got[0].request_id.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_room_members() {
        let f = fixture();
        let (a, mut rx) = join(&f.hub, "a", Role::Dm, "S1").await;
        let (_b, _rx_b) = join(&f.hub, "b", Role::Player, "S1").await;

        f.router
            .dispatch(&a, inbound(r#"{"type":"room_members","requestId":"m"}"#))
            .await;

        let got = frames(&f.hub, &mut rx).await;
        let members = got[0].data["members"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["userId"], "a");
        assert_eq!(members[1]["role"], "player");
    }
}
