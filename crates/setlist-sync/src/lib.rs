//! Shared pieces of the setlist room relay: room identifiers, the wire
//! protocol, the client-side mirror of a room and the scroll reconciler
//! used by followers.
//!
//! The relay server lives in the `setlist-relay` app; participants use
//! [`client::RoomConnection`] directly or let [`client::SyncSession`]
//! keep them joined across reconnects.

pub mod client;
pub mod protocol;
pub mod reconcile;
pub mod room_id;
pub mod state;
pub mod store;

pub use client::{ClientError, RoomConnection, SessionEvent, SessionHandle, SyncSession};
pub use protocol::{ClientMessage, ContentUpdate, RoomSnapshot, ScrollSync, ServerMessage};
pub use reconcile::{LayoutViewport, Reconciler, ScrollTarget, Strategy, Viewport};
pub use room_id::{RoomId, RoomIdError};
pub use state::ClientSyncState;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, Preferences, StoreError};
