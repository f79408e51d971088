use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use setlist_relay::{config::Config, registry::RoomRegistry, AppState};
use setlist_sync::client::{Backoff, RoomConnection, SessionEvent, SyncSession};
use setlist_sync::protocol::{ContentUpdate, ScrollSync, ServerMessage};
use setlist_sync::store::{KeyValueStore, MemoryStore, Preferences};
use setlist_sync::RoomId;

const STEP: Duration = Duration::from_secs(5);

async fn spawn_relay(config: Config) -> (String, RoomRegistry) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = RoomRegistry::new(config.registry_config());
    let state = AppState::new(registry.clone(), config, None);
    tokio::spawn(async move {
        let _ = setlist_relay::serve(listener, state).await;
    });
    (format!("ws://{addr}/ws"), registry)
}

/// Every event that arrived before a ping round-trip.
async fn flush(connection: &mut RoomConnection) -> Vec<ServerMessage> {
    connection.flush().await.expect("relay answered the ping")
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

async fn next_session_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(STEP, events.recv())
        .await
        .expect("session event in time")
        .expect("session still running")
}

fn abcd() -> RoomId {
    RoomId::parse("ABCD").unwrap()
}

#[test_timeout::tokio_timeout_test]
async fn master_drop_and_reclaim_leaves_clients_undisturbed() {
    let (url, registry) = spawn_relay(Config::default()).await;

    let mut a = RoomConnection::connect(&url).await.unwrap();
    let created = a.join(&abcd(), None).await.unwrap();
    assert!(created.is_master);
    let token = created.master_token.clone().expect("fresh token");
    a.set_content(&abcd(), ContentUpdate::document("intro")).unwrap();
    flush(&mut a).await;

    let mut b = RoomConnection::connect(&url).await.unwrap();
    let joined = b.join(&abcd(), None).await.unwrap();
    assert!(!joined.is_master);
    assert_eq!(joined.master_token, None);
    assert_eq!(joined.document, "intro");

    a.set_content(&abcd(), ContentUpdate::document("X")).unwrap();
    match timeout(STEP, b.next_event()).await.unwrap() {
        Some(ServerMessage::ContentUpdated(content)) => assert_eq!(content.document, "X"),
        other => panic!("expected content-updated, got {other:?}"),
    }
    assert!(flush(&mut a).await.is_empty(), "sender must not get its own update");

    drop(a);
    wait_until(|| registry.status(&abcd()).is_some_and(|s| !s.master_connected)).await;
    assert!(registry.contains(&abcd()));

    let mut a2 = RoomConnection::connect(&url).await.unwrap();
    let reclaimed = a2.join(&abcd(), Some(&token)).await.unwrap();
    assert!(reclaimed.is_master);
    assert_eq!(reclaimed.master_token.as_deref(), Some(token.as_str()));
    assert_eq!(reclaimed.document, "X");

    a2.sync_scroll(
        &abcd(),
        ScrollSync {
            percent: 40.0,
            pixel_position: Some(320.0),
            line_index: Some(12),
        },
    )
    .unwrap();
    match timeout(STEP, b.next_event()).await.unwrap() {
        Some(ServerMessage::ScrollSynced(sync)) => {
            assert_eq!(sync.percent, 40.0);
            assert_eq!(sync.line_index, Some(12));
        }
        other => panic!("expected scroll-synced, got {other:?}"),
    }

    // B is still a plain client: its writes change nothing.
    b.set_content(&abcd(), ContentUpdate::document("hijack")).unwrap();
    assert!(flush(&mut b).await.is_empty());
    assert!(flush(&mut a2).await.is_empty());
    let observer = RoomConnection::connect(&url).await.unwrap();
    assert_eq!(observer.join(&abcd(), None).await.unwrap().document, "X");
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_get_explicit_errors() {
    let (url, registry) = spawn_relay(Config::default()).await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    socket
        .send(Message::Text(
            r#"{"event":"join","roomId":"A!","ack":7}"#.to_string().into(),
        ))
        .await
        .unwrap();
    match read_server_message(&mut socket).await {
        ServerMessage::Ack(ack) => {
            assert_eq!(ack.ack, 7);
            assert!(ack.snapshot.is_none());
            assert!(ack.error.is_some());
        }
        other => panic!("expected error ack, got {other:?}"),
    }

    socket
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    assert!(matches!(
        read_server_message(&mut socket).await,
        ServerMessage::Error(_)
    ));
    assert_eq!(registry.room_count(), 0);
}

async fn read_server_message<S>(socket: &mut S) -> ServerMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(STEP, socket.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn create_room_rejects_taken_custom_id() {
    let (url, _registry) = spawn_relay(Config::default()).await;
    let a = RoomConnection::connect(&url).await.unwrap();
    a.join(&abcd(), None).await.unwrap();

    let b = RoomConnection::connect(&url).await.unwrap();
    let err = b.create_room(Some(&abcd()), false).await.unwrap_err();
    assert!(err.to_string().contains("room already exists"));

    let fresh = b.create_room(None, true).await.unwrap();
    assert!(fresh.is_master);
    assert!(fresh.master_token.is_some());
    assert_ne!(fresh.room_id, abcd());
}

#[test_timeout::tokio_timeout_test]
async fn session_reclaims_master_after_heartbeat_drop() {
    let config = Config {
        heartbeat_timeout: Duration::from_millis(300),
        ..Config::default()
    };
    let (url, registry) = spawn_relay(config).await;
    let store = Arc::new(MemoryStore::new());

    let (session, _handle) = SyncSession::new(url, abcd(), Arc::clone(&store));
    let session = session.with_backoff(Backoff::new(
        Duration::from_millis(50),
        Duration::from_millis(200),
    ));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    tokio::spawn(session.run(events_tx));

    let SessionEvent::Joined { snapshot } = next_session_event(&mut events).await else {
        panic!("expected first join");
    };
    assert!(snapshot.is_master);
    let token = snapshot.master_token.expect("token on creation");
    assert_eq!(Preferences::new(&store).master_token(&abcd()), Some(token.clone()));

    // The session pings far less often than the relay's heartbeat window.
    assert!(matches!(
        next_session_event(&mut events).await,
        SessionEvent::Disconnected { .. }
    ));
    let SessionEvent::Joined { snapshot } = next_session_event(&mut events).await else {
        panic!("expected rejoin");
    };
    assert!(snapshot.is_master);
    assert_eq!(snapshot.master_token, Some(token));
    assert!(registry.contains(&abcd()));
}

#[test_timeout::tokio_timeout_test]
async fn session_writes_fan_out_and_close_ends_every_session() {
    let (url, registry) = spawn_relay(Config::default()).await;

    let master_store = Arc::new(MemoryStore::new());
    let (master, handle) = SyncSession::new(url.clone(), abcd(), Arc::clone(&master_store));
    let (master_tx, mut master_events) = mpsc::unbounded_channel();
    let master_task = tokio::spawn(master.run(master_tx));
    let SessionEvent::Joined { snapshot } = next_session_event(&mut master_events).await else {
        panic!("expected master join");
    };
    assert!(snapshot.is_master);

    // A stale token on the follower's device is treated as no token.
    let follower_store = Arc::new(MemoryStore::new());
    follower_store.set("master-token-ABCD", "stale").unwrap();
    let (follower, _follower_handle) =
        SyncSession::new(url.clone(), abcd(), Arc::clone(&follower_store));
    let (follower_tx, mut follower_events) = mpsc::unbounded_channel();
    let follower_task = tokio::spawn(follower.run(follower_tx));
    let SessionEvent::Joined { snapshot } = next_session_event(&mut follower_events).await else {
        panic!("expected follower join");
    };
    assert!(!snapshot.is_master);

    handle
        .set_content(ContentUpdate {
            current_title: Some("Amazing Grace".into()),
            ..ContentUpdate::document("[G]Amazing grace")
        })
        .unwrap();
    match next_session_event(&mut follower_events).await {
        SessionEvent::ContentUpdated { content, change } => {
            assert_eq!(content.document, "[G]Amazing grace");
            assert_eq!(content.current_title, "Amazing Grace");
            assert!(change.document_changed);
        }
        other => panic!("expected content update, got {other:?}"),
    }

    handle.sync_scroll(ScrollSync::percent(25.0)).unwrap();
    match next_session_event(&mut follower_events).await {
        SessionEvent::ScrollSynced { target } => assert_eq!(target.percent, Some(25.0)),
        other => panic!("expected scroll sync, got {other:?}"),
    }

    handle.close(Some("set over".into())).unwrap();
    match next_session_event(&mut follower_events).await {
        SessionEvent::Closed(closed) => assert_eq!(closed.reason.as_deref(), Some("set over")),
        other => panic!("expected room-closed, got {other:?}"),
    }

    timeout(STEP, master_task).await.unwrap().unwrap().unwrap();
    timeout(STEP, follower_task).await.unwrap().unwrap().unwrap();
    assert!(!registry.contains(&abcd()));
    assert_eq!(Preferences::new(&master_store).master_token(&abcd()), None);
    assert_eq!(Preferences::new(&follower_store).master_token(&abcd()), None);
}

#[test_timeout::tokio_timeout_test]
async fn joining_another_room_leaves_the_first() {
    let (url, registry) = spawn_relay(Config::default()).await;
    let mut a = RoomConnection::connect(&url).await.unwrap();
    a.join(&abcd(), None).await.unwrap();
    let mut b = RoomConnection::connect(&url).await.unwrap();
    b.join(&abcd(), None).await.unwrap();
    assert_eq!(registry.status(&abcd()).unwrap().members, 2);

    let efgh = RoomId::parse("EFGH").unwrap();
    let moved = b.join(&efgh, None).await.unwrap();
    assert!(moved.is_master);
    assert_eq!(registry.status(&abcd()).unwrap().members, 1);
    assert_eq!(registry.status(&efgh).unwrap().members, 1);

    a.set_content(&abcd(), ContentUpdate::document("ABCD only")).unwrap();
    flush(&mut a).await;
    assert!(flush(&mut b).await.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn session_ends_cleanly_once_every_handle_is_dropped() {
    let (url, registry) = spawn_relay(Config::default()).await;
    let master = RoomConnection::connect(&url).await.unwrap();
    master.join(&abcd(), None).await.unwrap();

    let (follower, handle) = SyncSession::new(url, abcd(), MemoryStore::new());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let task = tokio::spawn(follower.run(events_tx));
    assert!(matches!(
        next_session_event(&mut events).await,
        SessionEvent::Joined { .. }
    ));
    assert_eq!(registry.status(&abcd()).unwrap().members, 2);

    drop(handle);
    timeout(STEP, task).await.unwrap().unwrap().unwrap();
    wait_until(|| registry.status(&abcd()).is_some_and(|s| s.members == 1)).await;
    assert!(registry.status(&abcd()).unwrap().master_connected);
}
