use crate::protocol::{ContentUpdated, RoomSnapshot, ScrollState, ScrollSync, SongMeta};
use crate::reconcile::ScrollTarget;
use crate::room_id::RoomId;

/// Client-side mirror of a room. Rebuilt from the snapshot on every
/// join or reconnect; never persisted.
#[derive(Debug, Clone, Default)]
pub struct ClientSyncState {
    room_id: Option<RoomId>,
    is_master: bool,
    master_token: Option<String>,
    document: String,
    scroll: ScrollState,
    meta: SongMeta,
}

/// What an applied `content-updated` changed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChange {
    pub document_changed: bool,
    pub meta_changed: bool,
}

impl ClientSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with `snapshot`. A token is kept only when the
    /// snapshot grants master and carries one.
    pub fn apply_snapshot(&mut self, snapshot: &RoomSnapshot) {
        *self = Self {
            room_id: Some(snapshot.room_id.clone()),
            is_master: snapshot.is_master,
            master_token: snapshot
                .master_token
                .clone()
                .filter(|_| snapshot.is_master),
            document: snapshot.document.clone(),
            scroll: snapshot.scroll_state,
            meta: snapshot.song_meta.clone(),
        };
    }

    pub fn apply_content(&mut self, update: &ContentUpdated) -> ContentChange {
        let meta = SongMeta {
            current_title: update.current_title.clone(),
            up_next_title: update.up_next_title.clone(),
            previous_title: update.previous_title.clone(),
            transpose_semitones: update.transpose,
        };
        let change = ContentChange {
            document_changed: self.document != update.document,
            meta_changed: self.meta != meta,
        };
        if change.document_changed {
            self.document = update.document.clone();
        }
        self.meta = meta;
        change
    }

    /// Record the master's position and hand back what the viewport should
    /// converge to.
    pub fn apply_scroll(&mut self, sync: &ScrollSync) -> ScrollTarget {
        self.scroll = ScrollState {
            percent: sync.percent,
            pixel_position: sync.pixel_position.unwrap_or(0.0),
            line_index: sync.line_index,
        };
        ScrollTarget::from(sync)
    }

    /// Target for the position carried by the last snapshot or sync.
    pub fn scroll_target(&self) -> ScrollTarget {
        ScrollTarget::from(&self.scroll)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn master_token(&self) -> Option<&str> {
        self.master_token.as_deref()
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn scroll(&self) -> &ScrollState {
        &self.scroll
    }

    pub fn meta(&self) -> &SongMeta {
        &self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(is_master: bool, token: Option<&str>) -> RoomSnapshot {
        RoomSnapshot {
            room_id: RoomId::parse("ABCD").unwrap(),
            is_master,
            master_token: token.map(str::to_string),
            document: "{title: Amazing}".into(),
            scroll_state: ScrollState {
                percent: 25.0,
                pixel_position: 120.0,
                line_index: Some(3),
            },
            song_meta: SongMeta {
                current_title: "Amazing".into(),
                ..SongMeta::default()
            },
        }
    }

    #[test_timeout::timeout]
    fn snapshot_rebuilds_state() {
        let mut state = ClientSyncState::new();
        state.apply_snapshot(&snapshot(true, Some("secret")));
        assert!(state.is_master());
        assert_eq!(state.master_token(), Some("secret"));

        state.apply_snapshot(&snapshot(false, None));
        assert!(!state.is_master());
        assert_eq!(state.master_token(), None);
        assert_eq!(state.document(), "{title: Amazing}");
        assert_eq!(state.scroll().line_index, Some(3));
    }

    #[test_timeout::timeout]
    fn content_update_reports_document_change() {
        let mut state = ClientSyncState::new();
        state.apply_snapshot(&snapshot(false, None));
        let update = ContentUpdated {
            document: "{title: Amazing}".into(),
            current_title: "Amazing".into(),
            up_next_title: "Be Thou".into(),
            previous_title: String::new(),
            transpose: 2,
        };
        let change = state.apply_content(&update);
        assert!(!change.document_changed);
        assert!(change.meta_changed);
        assert_eq!(state.meta().transpose_semitones, 2);

        let change = state.apply_content(&ContentUpdated {
            document: "X".into(),
            ..update
        });
        assert!(change.document_changed);
        assert!(!change.meta_changed);
        assert_eq!(state.document(), "X");
    }

    #[test_timeout::timeout]
    fn scroll_sync_defaults_missing_pixel_to_zero() {
        let mut state = ClientSyncState::new();
        let target = state.apply_scroll(&ScrollSync::percent(40.0));
        assert_eq!(target.percent, Some(40.0));
        assert_eq!(target.pixel_position, None);
        assert_eq!(state.scroll().pixel_position, 0.0);
        assert_eq!(state.scroll().line_index, None);
    }
}
