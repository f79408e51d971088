use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use setlist_sync::client::{RoomConnection, SessionEvent, SyncSession};
use setlist_sync::protocol::ContentUpdate;
use setlist_sync::reconcile::{Applied, LayoutViewport, Reconciler, ScrollTarget};
use setlist_sync::store::{JsonFileStore, KeyValueStore, MemoryStore, Preferences};
use setlist_sync::RoomId;

/// Geometry of the headless viewport `watch` reconciles against.
const WATCH_LINE_HEIGHT: f64 = 24.0;
const WATCH_CLIENT_HEIGHT: f64 = 480.0;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "setlist-relay")]
#[command(about = "Setlist room relay server and debug clients")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve {
        /// Overrides SETLIST_RELAY_PORT
        #[arg(short, long)]
        port: Option<u16>,

        /// Overrides SETLIST_RELAY_BIND
        #[arg(long)]
        bind: Option<String>,
    },

    /// Follow a room and print what a client would see
    Watch {
        /// Relay websocket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        #[arg(short, long)]
        room: String,

        /// JSON file holding tokens and preferences between runs
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Publish a document to a room as its master
    Push {
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        #[arg(short, long)]
        room: String,

        /// File whose contents become the room document
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        up_next: Option<String>,

        #[arg(long)]
        previous: Option<String>,

        #[arg(long, allow_hyphen_values = true)]
        transpose: Option<i32>,

        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Print a freshly generated room id
    NewId {
        /// Two memorable words instead of random characters
        #[arg(long)]
        words: bool,
    },
}

pub struct PushArgs {
    pub url: String,
    pub room: String,
    pub file: PathBuf,
    pub title: Option<String>,
    pub up_next: Option<String>,
    pub previous: Option<String>,
    pub transpose: Option<i32>,
}

pub fn new_id(words: bool) -> RoomId {
    let mut rng = rand::thread_rng();
    if words {
        RoomId::generate_word_pair(&mut rng)
    } else {
        RoomId::generate(&mut rng)
    }
}

pub async fn run_watch(url: String, room: String, store: Option<PathBuf>) -> Result<()> {
    let room = RoomId::parse(&room).context("invalid room id")?;
    match store {
        Some(path) => watch_with(url, room, JsonFileStore::open(path)?).await,
        None => watch_with(url, room, MemoryStore::new()).await,
    }
}

async fn watch_with<S: KeyValueStore + 'static>(url: String, room: RoomId, store: S) -> Result<()> {
    let (session, _handle) = SyncSession::new(url, room, store);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = tokio::spawn(session.run(events_tx));

    let mut view = WatchView::new();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Joined { snapshot } => {
                println!(
                    "joined {} as {} ({} bytes, now playing {:?})",
                    snapshot.room_id,
                    if snapshot.is_master { "master" } else { "client" },
                    snapshot.document.len(),
                    snapshot.song_meta.current_title,
                );
                view.follow(ScrollTarget::from(&snapshot.scroll_state));
                report(view.show_document(&snapshot.document));
            }
            SessionEvent::ContentUpdated { content, change } => {
                if change.document_changed {
                    report(view.show_document(&content.document));
                }
                println!(
                    "content: now {:?}, next {:?}, previous {:?}, transpose {}",
                    content.current_title,
                    content.up_next_title,
                    content.previous_title,
                    content.transpose,
                );
            }
            SessionEvent::ScrollSynced { target } => report(view.follow(target)),
            SessionEvent::Disconnected { retry_in } => {
                eprintln!("connection lost; retrying in {retry_in:?}");
            }
            SessionEvent::Closed(closed) => {
                println!("room closed ({})", closed.reason.as_deref().unwrap_or("no reason"));
                break;
            }
        }
    }

    session.await??;
    Ok(())
}

/// Headless song view for `watch`. Every re-render re-applies the last
/// position the master sent.
struct WatchView {
    viewport: Arc<Mutex<LayoutViewport>>,
    reconciler: Reconciler<LayoutViewport>,
    last_target: ScrollTarget,
}

impl WatchView {
    fn new() -> Self {
        let viewport = Arc::new(Mutex::new(LayoutViewport::new(
            0,
            WATCH_LINE_HEIGHT,
            WATCH_CLIENT_HEIGHT,
        )));
        Self {
            reconciler: Reconciler::new(Arc::clone(&viewport)),
            viewport,
            last_target: ScrollTarget::default(),
        }
    }

    fn show_document(&mut self, document: &str) -> JoinHandle<Option<Applied>> {
        let lines = u32::try_from(document.lines().count()).unwrap_or(u32::MAX);
        self.viewport.lock().relayout(lines, WATCH_LINE_HEIGHT);
        self.reconciler.reconcile(self.last_target)
    }

    fn follow(&mut self, target: ScrollTarget) -> JoinHandle<Option<Applied>> {
        self.last_target = target;
        self.reconciler.reconcile(target)
    }
}

/// Print the reconciled offset once the staged attempts settle, without
/// holding up the event loop.
fn report(attempt: JoinHandle<Option<Applied>>) {
    tokio::spawn(async move {
        match attempt.await {
            Ok(Some(applied)) => println!(
                "scroll: {:?} -> offset {:.1}",
                applied.strategy, applied.offset
            ),
            Ok(None) => debug!("scroll target superseded or not applicable"),
            Err(err) => debug!(error = %err, "reconcile task failed"),
        }
    });
}

pub async fn run_push(args: PushArgs, store: Option<PathBuf>) -> Result<()> {
    match store {
        Some(path) => push_with(args, JsonFileStore::open(path)?).await,
        None => push_with(args, MemoryStore::new()).await,
    }
}

async fn push_with<S: KeyValueStore>(args: PushArgs, store: S) -> Result<()> {
    let room = RoomId::parse(&args.room).context("invalid room id")?;
    let document = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let prefs = Preferences::new(&store);

    let mut connection = RoomConnection::connect(&args.url)
        .await?
        .with_ack_timeout(FLUSH_TIMEOUT);
    let snapshot = connection
        .join(&room, prefs.master_token(&room).as_deref())
        .await?;
    if let Some(token) = snapshot.master_token.as_deref() {
        prefs.set_master_token(&room, token)?;
    }
    prefs.set_last_room(&room)?;
    if !snapshot.is_master {
        bail!("not master of room {room}; no valid token stored for it");
    }

    connection.set_content(
        &room,
        ContentUpdate {
            document: Some(document),
            current_title: args.title,
            up_next_title: args.up_next,
            previous_title: args.previous,
            transpose: args.transpose,
        },
    )?;

    connection
        .flush()
        .await
        .context("relay did not confirm the write")?;
    connection.shutdown().await;

    println!("pushed {} to room {room}", args.file.display());
    Ok(())
}
