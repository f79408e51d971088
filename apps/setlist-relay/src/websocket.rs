use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use setlist_sync::protocol::{Ack, ClientMessage, ErrorMessage, ServerMessage};
use setlist_sync::RoomId;

use crate::registry::{MasterGrant, Outbound, RoomRegistry, WriteOutcome};
use crate::session::ChannelId;
use crate::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    remote: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Response {
    let remote_addr = remote.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: Option<SocketAddr>) {
    let channel = ChannelId::new();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    info!(channel = %channel, remote = ?remote_addr, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode server message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = Connection {
        channel,
        outbound: tx,
        membership: None,
    };
    let heartbeat = state.config.heartbeat_timeout;

    loop {
        let frame = match timeout(heartbeat, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                debug!(channel = %channel, error = %err, "websocket read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(
                    channel = %channel,
                    ?heartbeat,
                    "no traffic within heartbeat timeout; dropping"
                );
                break;
            }
        };
        match frame {
            Message::Text(text) => connection.handle_text(&state.registry, &text),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => connection.handle_text(&state.registry, text),
                Err(_) => connection.send(ServerMessage::Error(ErrorMessage {
                    message: "binary frames must be UTF-8 JSON".into(),
                })),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    connection.disconnect(&state.registry);
    drop(connection);
    writer.abort();
    info!(channel = %channel, "websocket closed");
}

struct Membership {
    room_id: RoomId,
    grant: Option<MasterGrant>,
}

/// Per-socket protocol state. A socket is in at most one room.
struct Connection {
    channel: ChannelId,
    outbound: Outbound,
    membership: Option<Membership>,
}

impl Connection {
    fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    fn handle_text(&mut self, registry: &RoomRegistry, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                self.reject(text, &err);
                return;
            }
        };

        match message {
            ClientMessage::Join(request) => {
                let outcome = registry.join(
                    self.channel,
                    self.outbound.clone(),
                    &request.room_id,
                    request.master_token.as_deref(),
                );
                self.enter(registry, request.room_id, outcome.grant);
                self.send(ServerMessage::Ack(Ack::snapshot(
                    request.ack.unwrap_or_default(),
                    outcome.snapshot,
                )));
            }
            ClientMessage::CreateRoom(request) => {
                let ack = request.ack.unwrap_or_default();
                match registry.create_room(
                    self.channel,
                    self.outbound.clone(),
                    request.room_id.as_ref(),
                    request.word_pair,
                ) {
                    Ok(outcome) => {
                        let room_id = outcome.snapshot.room_id.clone();
                        self.enter(registry, room_id, outcome.grant);
                        self.send(ServerMessage::Ack(Ack::snapshot(ack, outcome.snapshot)));
                    }
                    Err(err) => self.send(ServerMessage::Ack(Ack::error(ack, err.to_string()))),
                }
            }
            ClientMessage::SetContent(request) => {
                let grant = self.grant_for(&request.room_id);
                let outcome =
                    registry.set_content(self.channel, grant, &request.room_id, request.update);
                self.log_write("setContent", &request.room_id, outcome);
            }
            ClientMessage::SyncScroll(request) => {
                let grant = self.grant_for(&request.room_id);
                let outcome =
                    registry.sync_scroll(self.channel, grant, &request.room_id, request.scroll);
                self.log_write("syncScroll", &request.room_id, outcome);
            }
            ClientMessage::CloseRoom(request) => {
                let outcome = registry.close(
                    self.channel,
                    &request.room_id,
                    &request.master_token,
                    request.reason,
                );
                if matches!(outcome, WriteOutcome::Applied { .. }) && self.is_in(&request.room_id) {
                    self.membership = None;
                }
                self.log_write("close-room", &request.room_id, outcome);
            }
            ClientMessage::Leave(request) => {
                if self.is_in(&request.room_id) {
                    registry.leave(self.channel, &request.room_id);
                    self.membership = None;
                }
            }
            ClientMessage::Ping => self.send(ServerMessage::Pong),
        }
    }

    /// Malformed frames never reach the registry. A frame that still
    /// carries a numeric `ack` gets an error ack so the caller's wait ends.
    fn reject(&self, text: &str, err: &serde_json::Error) {
        debug!(channel = %self.channel, error = %err, "rejecting malformed frame");
        let ack = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.get("ack").and_then(Value::as_u64));
        let reply = match ack {
            Some(ack) => ServerMessage::Ack(Ack::error(ack, format!("invalid request: {err}"))),
            None => ServerMessage::Error(ErrorMessage {
                message: format!("invalid message: {err}"),
            }),
        };
        self.send(reply);
    }

    fn enter(&mut self, registry: &RoomRegistry, room_id: RoomId, grant: Option<MasterGrant>) {
        if let Some(previous) = self.membership.take() {
            if previous.room_id != room_id {
                registry.leave(self.channel, &previous.room_id);
            }
        }
        self.membership = Some(Membership { room_id, grant });
    }

    fn is_in(&self, room_id: &RoomId) -> bool {
        self.membership
            .as_ref()
            .is_some_and(|membership| &membership.room_id == room_id)
    }

    fn grant_for(&self, room_id: &RoomId) -> Option<&MasterGrant> {
        self.membership
            .as_ref()
            .filter(|membership| &membership.room_id == room_id)
            .and_then(|membership| membership.grant.as_ref())
    }

    fn log_write(&self, op: &'static str, room_id: &RoomId, outcome: WriteOutcome) {
        if let WriteOutcome::Applied { delivered } = outcome {
            debug!(channel = %self.channel, room = %room_id, op, delivered, "write applied");
        }
    }

    fn disconnect(&mut self, registry: &RoomRegistry) {
        if let Some(membership) = self.membership.take() {
            registry.disconnect(self.channel, &membership.room_id);
        }
    }
}
