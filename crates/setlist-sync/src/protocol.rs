//! Wire messages exchanged between room participants and the relay.
//!
//! Frames are JSON objects tagged by `"event"`. Event names keep the
//! mixed `setContent` / `content-updated` spelling the web clients already
//! speak, so they are renamed one by one rather than with `rename_all`.

use serde::{Deserialize, Serialize};

use crate::room_id::RoomId;

/// Where the master currently is, in three redundant forms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollState {
    pub percent: f64,
    pub pixel_position: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_index: Option<u32>,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self {
            percent: 0.0,
            pixel_position: 0.0,
            line_index: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongMeta {
    #[serde(default)]
    pub current_title: String,
    #[serde(default)]
    pub up_next_title: String,
    #[serde(default)]
    pub previous_title: String,
    #[serde(default)]
    pub transpose_semitones: i32,
}

/// Room state handed to a participant when it joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub is_master: bool,
    /// Present only on the response that created the room or reclaimed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_token: Option<String>,
    pub document: String,
    pub scroll_state: ScrollState,
    pub song_meta: SongMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub word_pair: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

/// Master write of document text and song metadata. Absent fields keep
/// their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_next_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transpose: Option<i32>,
}

impl ContentUpdate {
    pub fn document(document: impl Into<String>) -> Self {
        Self {
            document: Some(document.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetContentRequest {
    pub room_id: RoomId,
    #[serde(flatten)]
    pub update: ContentUpdate,
}

/// Scroll position as reported by the master and fanned out to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollSync {
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_index: Option<u32>,
}

impl ScrollSync {
    pub fn percent(percent: f64) -> Self {
        Self {
            percent,
            pixel_position: None,
            line_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncScrollRequest {
    pub room_id: RoomId,
    #[serde(flatten)]
    pub scroll: ScrollSync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRoomRequest {
    pub room_id: RoomId,
    pub master_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub room_id: RoomId,
}

/// Messages sent from a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join(JoinRequest),
    #[serde(rename = "create-room")]
    CreateRoom(CreateRoomRequest),
    #[serde(rename = "setContent")]
    SetContent(SetContentRequest),
    #[serde(rename = "syncScroll")]
    SyncScroll(SyncScrollRequest),
    #[serde(rename = "close-room")]
    CloseRoom(CloseRoomRequest),
    #[serde(rename = "leave")]
    Leave(LeaveRequest),
    #[serde(rename = "ping")]
    Ping,
}

/// Full content after a master write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUpdated {
    pub document: String,
    pub current_title: String,
    pub up_next_title: String,
    pub previous_title: String,
    pub transpose: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomClosed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Acknowledgement for a `join` or `create-room` carrying an `ack` id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub ack: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<RoomSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn snapshot(ack: u64, snapshot: RoomSnapshot) -> Self {
        Self {
            ack,
            snapshot: Some(snapshot),
            error: None,
        }
    }

    pub fn error(ack: u64, error: impl Into<String>) -> Self {
        Self {
            ack,
            snapshot: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// Messages sent from the relay to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    #[serde(rename = "ack")]
    Ack(Ack),
    #[serde(rename = "content-updated")]
    ContentUpdated(ContentUpdated),
    #[serde(rename = "scroll-synced")]
    ScrollSynced(ScrollSync),
    #[serde(rename = "room-closed")]
    RoomClosed(RoomClosed),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error(ErrorMessage),
}

impl ServerMessage {
    /// Event name as it appears on the wire; used for metrics labels.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Ack(_) => "ack",
            ServerMessage::ContentUpdated(_) => "content-updated",
            ServerMessage::ScrollSynced(_) => "scroll-synced",
            ServerMessage::RoomClosed(_) => "room-closed",
            ServerMessage::Pong => "pong",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn join_frame_uses_web_client_field_names() {
        let frame = json!({"event": "join", "roomId": "abcd", "masterToken": "t0k", "ack": 3});
        let parsed: ClientMessage = serde_json::from_value(frame).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Join(JoinRequest {
                room_id: RoomId::parse("ABCD").unwrap(),
                master_token: Some("t0k".into()),
                ack: Some(3),
            })
        );
    }

    #[test_timeout::timeout]
    fn set_content_accepts_partial_payloads() {
        let frame = json!({"event": "setContent", "roomId": "ABCD", "document": "X"});
        let parsed: ClientMessage = serde_json::from_value(frame).unwrap();
        let ClientMessage::SetContent(request) = parsed else {
            panic!("expected setContent");
        };
        assert_eq!(request.update, ContentUpdate::document("X"));
    }

    #[test_timeout::timeout]
    fn sync_scroll_requires_percent() {
        let missing = json!({"event": "syncScroll", "roomId": "ABCD", "pixelPosition": 10.0});
        assert!(serde_json::from_value::<ClientMessage>(missing).is_err());

        let frame = json!({"event": "syncScroll", "roomId": "ABCD", "percent": 50, "lineIndex": 4});
        let ClientMessage::SyncScroll(request) = serde_json::from_value(frame).unwrap() else {
            panic!("expected syncScroll");
        };
        assert_eq!(request.scroll.percent, 50.0);
        assert_eq!(request.scroll.pixel_position, None);
        assert_eq!(request.scroll.line_index, Some(4));
    }

    #[test_timeout::timeout]
    fn malformed_room_id_fails_to_parse() {
        let frame = json!({"event": "join", "roomId": "A!"});
        assert!(serde_json::from_value::<ClientMessage>(frame).is_err());
    }

    #[test_timeout::timeout]
    fn scroll_synced_omits_absent_hints() {
        let message = ServerMessage::ScrollSynced(ScrollSync::percent(12.5));
        let value = serde_json::to_value(message).unwrap();
        assert_eq!(value, json!({"event": "scroll-synced", "percent": 12.5}));
    }

    #[test_timeout::timeout]
    fn snapshot_without_token_omits_field() {
        let snapshot = RoomSnapshot {
            room_id: RoomId::parse("ABCD").unwrap(),
            is_master: false,
            master_token: None,
            document: String::new(),
            scroll_state: ScrollState::default(),
            song_meta: SongMeta::default(),
        };
        let value = serde_json::to_value(ServerMessage::Ack(Ack::snapshot(1, snapshot))).unwrap();
        assert!(value["snapshot"].get("masterToken").is_none());
        assert_eq!(value["snapshot"]["isMaster"], json!(false));
    }
}
