use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the Prometheus recorder and the tracing subscriber.
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();
        init_tracing()?;
        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

/// Tracing only, for the client subcommands.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")
}

fn describe_metrics() {
    describe_gauge!("setlist_relay_rooms_active", "Rooms currently held in memory");
    describe_counter!("setlist_relay_rooms_created_total", "Rooms created");
    describe_counter!("setlist_relay_joins_total", "Room joins by granted role");
    describe_counter!(
        "setlist_relay_master_reclaims_total",
        "Master authority redeemed with a token"
    );
    describe_counter!(
        "setlist_relay_unauthorized_writes_total",
        "Writes dropped because the caller is not master"
    );
    describe_counter!("setlist_relay_broadcasts_total", "Messages fanned out to members");
    describe_counter!("setlist_relay_rooms_closed_total", "Rooms torn down by reason");
}
