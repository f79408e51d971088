use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{
    mapref::entry::{Entry, VacantEntry},
    DashMap,
};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use setlist_sync::protocol::{
    ContentUpdate, ContentUpdated, RoomClosed, RoomSnapshot, ScrollState, ScrollSync,
    ServerMessage, SongMeta,
};
use setlist_sync::RoomId;

use crate::session::{digest_token, mint_master_token, verify_token, ChannelId};

/// Outbound queue of one member. Unbounded, so a broadcast never waits
/// while the room lock is held.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

const GENERATE_ATTEMPTS: usize = 32;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Rooms whose master has been gone this long with no activity are
    /// closed. `None` keeps them forever.
    pub idle_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_ttl: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room already exists")]
    RoomExists,
    #[error("no unused room id found")]
    IdSpaceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Client,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    Active,
    Disconnected { since: Instant },
}

/// Proof, held by a connection, that it redeemed the master token of a
/// room. Only the registry can mint one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterGrant {
    room_id: RoomId,
    digest: String,
}

impl MasterGrant {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub snapshot: RoomSnapshot,
    pub grant: Option<MasterGrant>,
    pub created: bool,
}

impl JoinOutcome {
    pub fn role(&self) -> Role {
        if self.grant.is_some() {
            Role::Master
        } else {
            Role::Client
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied { delivered: usize },
    Unauthorized,
    Malformed,
    UnknownRoom,
}

/// Public view of a room. Never carries the token or the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub members: usize,
    pub master_connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    rooms: DashMap<RoomId, Arc<Room>>,
    config: RegistryConfig,
}

struct Room {
    room_id: RoomId,
    created_at: DateTime<Utc>,
    state: Mutex<RoomState>,
}

struct RoomState {
    closed: bool,
    token_digest: String,
    master_channel: ChannelId,
    master_status: MasterStatus,
    members: HashMap<ChannelId, Outbound>,
    document: String,
    scroll: ScrollState,
    meta: SongMeta,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
}

impl RoomState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn snapshot(
        &self,
        room_id: &RoomId,
        is_master: bool,
        master_token: Option<String>,
    ) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.clone(),
            is_master,
            master_token,
            document: self.document.clone(),
            scroll_state: self.scroll,
            song_meta: self.meta.clone(),
        }
    }

    fn content(&self) -> ContentUpdated {
        ContentUpdated {
            document: self.document.clone(),
            current_title: self.meta.current_title.clone(),
            up_next_title: self.meta.up_next_title.clone(),
            previous_title: self.meta.previous_title.clone(),
            transpose: self.meta.transpose_semitones,
        }
    }

    fn master_connected(&self) -> bool {
        matches!(self.master_status, MasterStatus::Active)
    }

    fn authorizes(
        &self,
        channel: ChannelId,
        grant: Option<&MasterGrant>,
        room_id: &RoomId,
    ) -> bool {
        self.master_connected()
            && self.master_channel == channel
            && grant.is_some_and(|g| &g.room_id == room_id && g.digest == self.token_digest)
    }

    /// Queue `message` for every member but `except`. Members whose queue
    /// is gone are dropped.
    fn broadcast(&mut self, except: Option<ChannelId>, message: &ServerMessage) -> usize {
        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for (id, outbound) in &self.members {
            if Some(*id) == except {
                continue;
            }
            if outbound.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            self.drop_member(id);
        }
        counter!(
            "setlist_relay_broadcasts_total",
            delivered as u64,
            "event" => message.event_name()
        );
        delivered
    }

    /// Returns whether the master's channel was the one dropped.
    fn drop_member(&mut self, channel: ChannelId) -> bool {
        self.members.remove(&channel);
        if self.master_channel == channel && self.master_connected() {
            self.master_status = MasterStatus::Disconnected {
                since: Instant::now(),
            };
            return true;
        }
        false
    }
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.inner.rooms.contains_key(room_id)
    }

    /// Join-or-create. A new room makes the caller master with a fresh
    /// token. An existing room makes the caller master only if
    /// `presented` is that room's token; anything else joins as a client
    /// without saying why.
    pub fn join(
        &self,
        channel: ChannelId,
        outbound: Outbound,
        room_id: &RoomId,
        presented: Option<&str>,
    ) -> JoinOutcome {
        loop {
            let room = match self.inner.rooms.entry(room_id.clone()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => return self.insert_new(entry, channel, outbound.clone()),
            };

            let mut state = room.state.lock();
            if state.closed {
                // Torn down between lookup and lock; the next pass creates it anew.
                continue;
            }
            state.members.insert(channel, outbound.clone());
            state.touch();

            if presented.is_some_and(|token| verify_token(token, &state.token_digest)) {
                let previous = std::mem::replace(&mut state.master_channel, channel);
                state.master_status = MasterStatus::Active;
                counter!("setlist_relay_master_reclaims_total", 1);
                counter!("setlist_relay_joins_total", 1, "role" => Role::Master.label());
                info!(
                    room = %room_id,
                    channel = %channel,
                    previous = %previous,
                    "master reclaimed room"
                );
                return JoinOutcome {
                    snapshot: state.snapshot(room_id, true, presented.map(str::to_string)),
                    grant: Some(MasterGrant {
                        room_id: room_id.clone(),
                        digest: state.token_digest.clone(),
                    }),
                    created: false,
                };
            }

            if state.master_channel == channel && state.master_connected() {
                // The live master re-sent a join on the same channel.
                return JoinOutcome {
                    snapshot: state.snapshot(room_id, true, None),
                    grant: Some(MasterGrant {
                        room_id: room_id.clone(),
                        digest: state.token_digest.clone(),
                    }),
                    created: false,
                };
            }

            counter!("setlist_relay_joins_total", 1, "role" => Role::Client.label());
            debug!(
                room = %room_id,
                channel = %channel,
                members = state.members.len(),
                "client joined room"
            );
            return JoinOutcome {
                snapshot: state.snapshot(room_id, false, None),
                grant: None,
                created: false,
            };
        }
    }

    /// Explicit creation. A requested id that is already taken is an
    /// error; without one a fresh unused id is generated.
    pub fn create_room(
        &self,
        channel: ChannelId,
        outbound: Outbound,
        requested: Option<&RoomId>,
        word_pair: bool,
    ) -> Result<JoinOutcome, RegistryError> {
        if let Some(room_id) = requested {
            return match self.inner.rooms.entry(room_id.clone()) {
                Entry::Occupied(_) => Err(RegistryError::RoomExists),
                Entry::Vacant(entry) => Ok(self.insert_new(entry, channel, outbound)),
            };
        }

        let mut rng = rand::thread_rng();
        for _ in 0..GENERATE_ATTEMPTS {
            let room_id = if word_pair {
                RoomId::generate_word_pair(&mut rng)
            } else {
                RoomId::generate(&mut rng)
            };
            if let Entry::Vacant(entry) = self.inner.rooms.entry(room_id) {
                return Ok(self.insert_new(entry, channel, outbound));
            }
        }
        Err(RegistryError::IdSpaceExhausted)
    }

    /// An id with no room behind it at the time of the call.
    pub fn unused_room_id(&self, word_pair: bool) -> Result<RoomId, RegistryError> {
        let mut rng = rand::thread_rng();
        (0..GENERATE_ATTEMPTS)
            .map(|_| {
                if word_pair {
                    RoomId::generate_word_pair(&mut rng)
                } else {
                    RoomId::generate(&mut rng)
                }
            })
            .find(|room_id| !self.contains(room_id))
            .ok_or(RegistryError::IdSpaceExhausted)
    }

    fn insert_new(
        &self,
        entry: VacantEntry<'_, RoomId, Arc<Room>>,
        channel: ChannelId,
        outbound: Outbound,
    ) -> JoinOutcome {
        let room_id = entry.key().clone();
        let token = mint_master_token();
        let digest = digest_token(&token);
        let now = Utc::now();

        let state = RoomState {
            closed: false,
            token_digest: digest.clone(),
            master_channel: channel,
            master_status: MasterStatus::Active,
            members: HashMap::from([(channel, outbound)]),
            document: String::new(),
            scroll: ScrollState::default(),
            meta: SongMeta::default(),
            last_activity: Instant::now(),
            last_activity_at: now,
        };
        let snapshot = state.snapshot(&room_id, true, Some(token));
        entry.insert(Arc::new(Room {
            room_id: room_id.clone(),
            created_at: now,
            state: Mutex::new(state),
        }));

        counter!("setlist_relay_rooms_created_total", 1);
        counter!("setlist_relay_joins_total", 1, "role" => Role::Master.label());
        gauge!("setlist_relay_rooms_active", self.room_count() as f64);
        info!(room = %room_id, channel = %channel, "room created");

        JoinOutcome {
            snapshot,
            grant: Some(MasterGrant { room_id, digest }),
            created: true,
        }
    }

    fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Runs `apply` under the room lock if `channel` is the room's master.
    fn with_master<F>(
        &self,
        channel: ChannelId,
        grant: Option<&MasterGrant>,
        room_id: &RoomId,
        op: &'static str,
        apply: F,
    ) -> WriteOutcome
    where
        F: FnOnce(&mut RoomState) -> usize,
    {
        let Some(room) = self.room(room_id) else {
            return WriteOutcome::UnknownRoom;
        };
        let mut state = room.state.lock();
        if state.closed {
            return WriteOutcome::UnknownRoom;
        }
        if !state.authorizes(channel, grant, room_id) {
            counter!("setlist_relay_unauthorized_writes_total", 1, "op" => op);
            debug!(room = %room_id, channel = %channel, op, "dropping write from non-master");
            return WriteOutcome::Unauthorized;
        }
        state.touch();
        let delivered = apply(&mut state);
        WriteOutcome::Applied { delivered }
    }

    /// Master write of document and metadata. Absent fields keep their
    /// stored value; everyone else receives the full content.
    pub fn set_content(
        &self,
        channel: ChannelId,
        grant: Option<&MasterGrant>,
        room_id: &RoomId,
        update: ContentUpdate,
    ) -> WriteOutcome {
        self.with_master(channel, grant, room_id, "setContent", move |state| {
            if let Some(document) = update.document {
                state.document = document;
            }
            if let Some(title) = update.current_title {
                state.meta.current_title = title;
            }
            if let Some(title) = update.up_next_title {
                state.meta.up_next_title = title;
            }
            if let Some(title) = update.previous_title {
                state.meta.previous_title = title;
            }
            if let Some(transpose) = update.transpose {
                state.meta.transpose_semitones = transpose;
            }
            let message = ServerMessage::ContentUpdated(state.content());
            state.broadcast(Some(channel), &message)
        })
    }

    pub fn sync_scroll(
        &self,
        channel: ChannelId,
        grant: Option<&MasterGrant>,
        room_id: &RoomId,
        scroll: ScrollSync,
    ) -> WriteOutcome {
        let Some(scroll) = sanitize_scroll(scroll) else {
            debug!(room = %room_id, channel = %channel, "dropping scroll with non-finite percent");
            return WriteOutcome::Malformed;
        };
        self.with_master(channel, grant, room_id, "syncScroll", move |state| {
            state.scroll = ScrollState {
                percent: scroll.percent,
                pixel_position: scroll.pixel_position.unwrap_or(0.0),
                line_index: scroll.line_index,
            };
            state.broadcast(Some(channel), &ServerMessage::ScrollSynced(scroll))
        })
    }

    /// Teardown by the current master channel presenting the room token.
    /// Every other member is told, then the room is gone.
    pub fn close(
        &self,
        channel: ChannelId,
        room_id: &RoomId,
        token: &str,
        reason: Option<String>,
    ) -> WriteOutcome {
        let Some(room) = self.room(room_id) else {
            return WriteOutcome::UnknownRoom;
        };
        let mut state = room.state.lock();
        if state.closed {
            return WriteOutcome::UnknownRoom;
        }
        if state.master_channel != channel || !verify_token(token, &state.token_digest) {
            counter!("setlist_relay_unauthorized_writes_total", 1, "op" => "close-room");
            debug!(room = %room_id, channel = %channel, "dropping close without valid token");
            return WriteOutcome::Unauthorized;
        }
        let delivered = self.teardown(&room, &mut state, Some(channel), reason, "explicit");
        WriteOutcome::Applied { delivered }
    }

    fn teardown(
        &self,
        room: &Arc<Room>,
        state: &mut RoomState,
        closer: Option<ChannelId>,
        reason: Option<String>,
        label: &'static str,
    ) -> usize {
        state.closed = true;
        let delivered = state.broadcast(closer, &ServerMessage::RoomClosed(RoomClosed { reason }));
        state.members.clear();
        self.inner
            .rooms
            .remove_if(&room.room_id, |_, existing| Arc::ptr_eq(existing, room));

        counter!("setlist_relay_rooms_closed_total", 1, "reason" => label);
        gauge!("setlist_relay_rooms_active", self.room_count() as f64);
        info!(room = %room.room_id, reason = label, notified = delivered, "room closed");
        delivered
    }

    pub fn leave(&self, channel: ChannelId, room_id: &RoomId) -> bool {
        self.remove_member(channel, room_id, "left")
    }

    /// Transport drop. A master's room is kept for its token to be
    /// redeemed.
    pub fn disconnect(&self, channel: ChannelId, room_id: &RoomId) -> bool {
        self.remove_member(channel, room_id, "disconnected")
    }

    fn remove_member(&self, channel: ChannelId, room_id: &RoomId, cause: &'static str) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };
        let mut state = room.state.lock();
        if state.closed || !state.members.contains_key(&channel) {
            return false;
        }
        if state.drop_member(channel) {
            info!(
                room = %room_id,
                channel = %channel,
                cause,
                "master channel gone; room awaits reclaim"
            );
        } else {
            debug!(room = %room_id, channel = %channel, cause, "member removed");
        }
        true
    }

    pub fn status(&self, room_id: &RoomId) -> Option<RoomStatus> {
        let room = self.room(room_id)?;
        let state = room.state.lock();
        if state.closed {
            return None;
        }
        Some(RoomStatus {
            room_id: room.room_id.clone(),
            members: state.members.len(),
            master_connected: state.master_connected(),
            created_at: room.created_at,
            last_activity: state.last_activity_at,
        })
    }

    pub fn master_status(&self, room_id: &RoomId) -> Option<MasterStatus> {
        let room = self.room(room_id)?;
        let state = room.state.lock();
        (!state.closed).then_some(state.master_status)
    }

    /// Close rooms whose master is disconnected and that saw no activity
    /// for `idle_ttl` as of `now`. No-op without an `idle_ttl`.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let Some(ttl) = self.inner.config.idle_ttl else {
            return 0;
        };
        let rooms: Vec<Arc<Room>> = self
            .inner
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut swept = 0usize;
        for room in rooms {
            let mut state = room.state.lock();
            if state.closed || state.master_connected() {
                continue;
            }
            if now.saturating_duration_since(state.last_activity) < ttl {
                continue;
            }
            self.teardown(&room, &mut state, None, Some("idle".into()), "idle");
            swept += 1;
        }
        swept
    }

    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let ttl = self.inner.config.idle_ttl?;
        let registry = self.clone();
        let period = self.inner.config.sweep_interval.max(Duration::from_secs(1));
        info!(idle_ttl = ?ttl, ?period, "idle room sweeper enabled");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let swept = registry.sweep_idle(Instant::now());
                if swept > 0 {
                    info!(swept, "closed idle rooms");
                }
            }
        }))
    }
}

/// Clamp percent into [0, 100] and drop unusable hints. `None` when the
/// percent itself is unusable.
fn sanitize_scroll(scroll: ScrollSync) -> Option<ScrollSync> {
    if !scroll.percent.is_finite() {
        return None;
    }
    Some(ScrollSync {
        percent: scroll.percent.clamp(0.0, 100.0),
        pixel_position: scroll.pixel_position.filter(|p| p.is_finite() && *p >= 0.0),
        line_index: scroll.line_index,
    })
}
