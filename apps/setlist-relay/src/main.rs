use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use setlist_relay::{
    cli::{self, Cli, Commands, PushArgs},
    config::Config,
    registry::RoomRegistry,
    telemetry::{self, Telemetry},
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => serve(None, None).await,
        Some(Commands::Serve { port, bind }) => serve(port, bind).await,
        Some(Commands::Watch { url, room, store }) => {
            telemetry::init_tracing()?;
            cli::run_watch(url, room, store).await
        }
        Some(Commands::Push {
            url,
            room,
            file,
            title,
            up_next,
            previous,
            transpose,
            store,
        }) => {
            telemetry::init_tracing()?;
            let args = PushArgs {
                url,
                room,
                file,
                title,
                up_next,
                previous,
                transpose,
            };
            cli::run_push(args, store).await
        }
        Some(Commands::NewId { words }) => {
            println!("{}", cli::new_id(words));
            Ok(())
        }
    }
}

async fn serve(port: Option<u16>, bind: Option<String>) -> Result<()> {
    let telemetry = Telemetry::init()?;

    let mut config = Config::from_env();
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind = bind;
    }
    info!(
        heartbeat_timeout = ?config.heartbeat_timeout,
        idle_ttl = ?config.idle_ttl,
        "starting setlist relay"
    );

    let registry = RoomRegistry::new(config.registry_config());
    let _sweeper = registry.spawn_sweeper();

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "setlist relay listening");

    let state = AppState::new(registry, config, Some(telemetry.metrics_handle()));
    setlist_relay::serve(listener, state).await
}
