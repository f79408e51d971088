//! Websocket client for the relay.
//!
//! [`RoomConnection`] is one transport channel: it sends requests, matches
//! acks to callers and surfaces broadcast events. [`SyncSession`] sits on
//! top of it and keeps a participant in its room across transport drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::{
    Ack, ClientMessage, CloseRoomRequest, ContentUpdate, ContentUpdated, CreateRoomRequest,
    JoinRequest, LeaveRequest, RoomClosed, RoomSnapshot, ScrollSync, ServerMessage,
    SetContentRequest, SyncScrollRequest,
};
use crate::reconcile::ScrollTarget;
use crate::room_id::RoomId;
use crate::state::{ClientSyncState, ContentChange};
use crate::store::{KeyValueStore, Preferences};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out after {0:?} waiting for the relay")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("relay rejected request: {0}")]
    Rejected(String),
    #[error("relay sent an ack without a snapshot")]
    MissingSnapshot,
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>;

/// One websocket to the relay.
pub struct RoomConnection {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedReceiver<ServerMessage>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    ack_timeout: Duration,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RoomConnection {
    /// Connect to `url`, which is the relay's websocket endpoint
    /// (e.g. `ws://127.0.0.1:8080/ws`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = timeout(DEFAULT_CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout(DEFAULT_CONNECT_TIMEOUT))??;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events) = mpsc::unbounded_channel::<ServerMessage>();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode client message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "websocket read failed");
                        break;
                    }
                };
                let message = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "unparseable frame from relay");
                        continue;
                    }
                };
                if let ServerMessage::Ack(ack) = message {
                    if let Some(waiter) = reader_pending.lock().remove(&ack.ack) {
                        let _ = waiter.send(ack);
                    }
                    continue;
                }
                if events_tx.send(message).is_err() {
                    break;
                }
            }
            // Dropping the senders fails every outstanding ack with `Closed`.
            reader_pending.lock().clear();
        });

        Ok(Self {
            outbound,
            events,
            pending,
            next_ack: AtomicU64::new(1),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            writer,
            reader,
        })
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub async fn join(
        &self,
        room_id: &RoomId,
        master_token: Option<&str>,
    ) -> Result<RoomSnapshot, ClientError> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let request = ClientMessage::Join(JoinRequest {
            room_id: room_id.clone(),
            master_token: master_token.map(str::to_string),
            ack: Some(id),
        });
        self.request(id, request).await
    }

    /// Create a room, with a generated id when `room_id` is `None`.
    pub async fn create_room(
        &self,
        room_id: Option<&RoomId>,
        word_pair: bool,
    ) -> Result<RoomSnapshot, ClientError> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let request = ClientMessage::CreateRoom(CreateRoomRequest {
            room_id: room_id.cloned(),
            word_pair,
            ack: Some(id),
        });
        self.request(id, request).await
    }

    async fn request(&self, id: u64, message: ClientMessage) -> Result<RoomSnapshot, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if let Err(err) = self.send(message) {
            self.pending.lock().remove(&id);
            return Err(err);
        }
        let ack = match timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(ClientError::Timeout(self.ack_timeout));
            }
        };
        if let Some(error) = ack.error {
            return Err(ClientError::Rejected(error));
        }
        ack.snapshot.ok_or(ClientError::MissingSnapshot)
    }

    pub fn set_content(&self, room_id: &RoomId, update: ContentUpdate) -> Result<(), ClientError> {
        self.send(ClientMessage::SetContent(SetContentRequest {
            room_id: room_id.clone(),
            update,
        }))
    }

    pub fn sync_scroll(&self, room_id: &RoomId, scroll: ScrollSync) -> Result<(), ClientError> {
        self.send(ClientMessage::SyncScroll(SyncScrollRequest {
            room_id: room_id.clone(),
            scroll,
        }))
    }

    pub fn close_room(
        &self,
        room_id: &RoomId,
        master_token: &str,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        self.send(ClientMessage::CloseRoom(CloseRoomRequest {
            room_id: room_id.clone(),
            master_token: master_token.to_string(),
            reason,
        }))
    }

    pub fn leave(&self, room_id: &RoomId) -> Result<(), ClientError> {
        self.send(ClientMessage::Leave(LeaveRequest {
            room_id: room_id.clone(),
        }))
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping)
    }

    fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound.send(message).map_err(|_| ClientError::Closed)
    }

    /// Round-trip a ping. Once it returns, every frame sent before it has
    /// been handled by the relay. Events that arrived meanwhile are
    /// returned in order.
    pub async fn flush(&mut self) -> Result<Vec<ServerMessage>, ClientError> {
        self.ping()?;
        let bound = self.ack_timeout;
        let events = &mut self.events;
        timeout(bound, async move {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Some(ServerMessage::Pong) => return Ok(seen),
                    Some(other) => seen.push(other),
                    None => return Err(ClientError::Closed),
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout(bound))?
    }

    /// Write out everything still queued, then close the socket.
    pub async fn shutdown(mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outbound, closed));
        if timeout(self.ack_timeout, &mut self.writer).await.is_err() {
            debug!("writer did not drain before shutdown timeout");
        }
    }

    /// Next broadcast event; `None` once the transport is gone.
    pub async fn next_event(&mut self) -> Option<ServerMessage> {
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.outbound.is_closed()
    }
}

impl Drop for RoomConnection {
    // Dropping without `shutdown` discards queued frames.
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Capped exponential reconnect delay. Retries never run out.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// What a [`SyncSession`] reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { snapshot: RoomSnapshot },
    ContentUpdated { content: ContentUpdated, change: ContentChange },
    ScrollSynced { target: ScrollTarget },
    Disconnected { retry_in: Duration },
    Closed(RoomClosed),
}

/// Master writes queued through a [`SessionHandle`].
#[derive(Debug, Clone)]
pub enum SessionCommand {
    SetContent(ContentUpdate),
    SyncScroll(ScrollSync),
    Close { reason: Option<String> },
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn set_content(&self, update: ContentUpdate) -> Result<(), ClientError> {
        self.send(SessionCommand::SetContent(update))
    }

    pub fn sync_scroll(&self, scroll: ScrollSync) -> Result<(), ClientError> {
        self.send(SessionCommand::SyncScroll(scroll))
    }

    pub fn close(&self, reason: Option<String>) -> Result<(), ClientError> {
        self.send(SessionCommand::Close { reason })
    }

    fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

enum ConnectionEnd {
    Dropped,
    RoomClosed,
    Shutdown,
}

/// Keeps one participant joined to one room, reclaiming master authority
/// with the stored token after every reconnect.
pub struct SyncSession<S> {
    url: String,
    room_id: RoomId,
    store: S,
    state: ClientSyncState,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    /// Close requested but not yet confirmed by the relay.
    pending_close: Option<Option<String>>,
}

impl<S: KeyValueStore> SyncSession<S> {
    pub fn new(url: impl Into<String>, room_id: RoomId, store: S) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let session = Self {
            url: url.into(),
            room_id,
            store,
            state: ClientSyncState::new(),
            backoff: Backoff::default(),
            commands,
            pending_close: None,
        };
        (session, SessionHandle { commands: commands_tx })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> &ClientSyncState {
        &self.state
    }

    /// Run until the room is closed, every [`SessionHandle`] is dropped, or
    /// `events` has no receiver left.
    pub async fn run(
        mut self,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), ClientError> {
        loop {
            let end = match self.connect_and_join(&events).await {
                Ok(mut connection) => {
                    self.backoff.reset();
                    let end = self.pump(&mut connection, &events).await;
                    if !matches!(end, ConnectionEnd::Dropped) {
                        connection.shutdown().await;
                    }
                    end
                }
                Err(err) => {
                    warn!(room = %self.room_id, error = %err, "failed to join room");
                    if let ClientError::Rejected(reason) = err {
                        return Err(ClientError::Rejected(reason));
                    }
                    ConnectionEnd::Dropped
                }
            };

            match end {
                ConnectionEnd::RoomClosed | ConnectionEnd::Shutdown => return Ok(()),
                ConnectionEnd::Dropped => {
                    self.state.reset();
                    let retry_in = self.backoff.next_delay();
                    info!(room = %self.room_id, ?retry_in, "connection lost; reconnecting");
                    if events.send(SessionEvent::Disconnected { retry_in }).is_err() {
                        return Ok(());
                    }
                    if !self.wait_discarding(retry_in).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep out the reconnect delay, dropping writes queued meanwhile.
    /// Returns `false` once every handle is gone.
    async fn wait_discarding(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        debug!(room = %self.room_id, ?command, "disconnected; discarding write");
                    }
                    None => return false,
                },
            }
        }
    }

    async fn connect_and_join(
        &mut self,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<RoomConnection, ClientError> {
        let connection = RoomConnection::connect(&self.url).await?;
        let prefs = Preferences::new(&self.store);
        let stored = prefs.master_token(&self.room_id);
        let snapshot = connection.join(&self.room_id, stored.as_deref()).await?;

        if let Some(token) = snapshot.master_token.as_deref() {
            if let Err(err) = prefs.set_master_token(&self.room_id, token) {
                warn!(room = %self.room_id, error = %err, "failed to persist master token");
            }
        }
        if let Err(err) = prefs.set_last_room(&self.room_id) {
            warn!(room = %self.room_id, error = %err, "failed to persist last room");
        }

        info!(room = %self.room_id, is_master = snapshot.is_master, "joined room");
        self.state.apply_snapshot(&snapshot);
        let _ = events.send(SessionEvent::Joined { snapshot });
        Ok(connection)
    }

    async fn pump(
        &mut self,
        connection: &mut RoomConnection,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> ConnectionEnd {
        if let Some(reason) = self.pending_close.take() {
            match self.send_close(connection, reason) {
                Ok(true) => return self.confirm_close(connection).await,
                Ok(false) => {}
                Err(_) => return ConnectionEnd::Dropped,
            }
        }

        let mut heartbeat = tokio::time::interval(PING_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                event = connection.next_event() => {
                    let Some(event) = event else {
                        return ConnectionEnd::Dropped;
                    };
                    let forwarded = match event {
                        ServerMessage::ContentUpdated(content) => {
                            let change = self.state.apply_content(&content);
                            SessionEvent::ContentUpdated { content, change }
                        }
                        ServerMessage::ScrollSynced(sync) => SessionEvent::ScrollSynced {
                            target: self.state.apply_scroll(&sync),
                        },
                        ServerMessage::RoomClosed(closed) => {
                            info!(room = %self.room_id, reason = ?closed.reason, "room closed");
                            self.forget_token();
                            let _ = events.send(SessionEvent::Closed(closed));
                            return ConnectionEnd::RoomClosed;
                        }
                        ServerMessage::Error(error) => {
                            warn!(
                                room = %self.room_id,
                                message = %error.message,
                                "relay reported an error"
                            );
                            continue;
                        }
                        ServerMessage::Ack(_) | ServerMessage::Pong => continue,
                    };
                    if events.send(forwarded).is_err() {
                        return ConnectionEnd::Shutdown;
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = connection.leave(&self.room_id);
                        return ConnectionEnd::Shutdown;
                    };
                    match self.forward(connection, command) {
                        Ok(true) => return self.confirm_close(connection).await,
                        Ok(false) => {}
                        Err(err) => {
                            debug!(room = %self.room_id, error = %err, "command not delivered");
                            return ConnectionEnd::Dropped;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if connection.ping().is_err() {
                        return ConnectionEnd::Dropped;
                    }
                }
            }
        }
    }

    fn forget_token(&self) {
        if let Err(err) = Preferences::new(&self.store).forget_master_token(&self.room_id) {
            warn!(room = %self.room_id, error = %err, "failed to forget master token");
        }
    }

    /// The token is forgotten only once the relay has handled the
    /// `close-room`. Otherwise the close is retried after reconnecting.
    async fn confirm_close(&mut self, connection: &mut RoomConnection) -> ConnectionEnd {
        match connection.flush().await {
            Ok(_) => {
                self.pending_close = None;
                info!(room = %self.room_id, "closed room");
                self.forget_token();
                ConnectionEnd::RoomClosed
            }
            Err(err) => {
                warn!(room = %self.room_id, error = %err, "close not confirmed; retrying");
                ConnectionEnd::Dropped
            }
        }
    }

    /// Send a queued write. `Ok(true)` means a close is on its way.
    fn forward(
        &mut self,
        connection: &RoomConnection,
        command: SessionCommand,
    ) -> Result<bool, ClientError> {
        if !self.state.is_master() {
            debug!(room = %self.room_id, ?command, "not master; discarding write");
            return Ok(false);
        }
        match command {
            SessionCommand::SetContent(update) => connection.set_content(&self.room_id, update)?,
            SessionCommand::SyncScroll(scroll) => connection.sync_scroll(&self.room_id, scroll)?,
            SessionCommand::Close { reason } => return self.send_close(connection, reason),
        }
        Ok(false)
    }

    fn send_close(
        &mut self,
        connection: &RoomConnection,
        reason: Option<String>,
    ) -> Result<bool, ClientError> {
        if !self.state.is_master() {
            warn!(room = %self.room_id, "no longer master; dropping close");
            return Ok(false);
        }
        let token = self
            .state
            .master_token()
            .map(str::to_string)
            .or_else(|| Preferences::new(&self.store).master_token(&self.room_id));
        let Some(token) = token else {
            warn!(room = %self.room_id, "no master token held; cannot close room");
            return Ok(false);
        };
        self.pending_close = Some(reason.clone());
        connection.close_room(&self.room_id, &token, reason)?;
        Ok(true)
    }
}
