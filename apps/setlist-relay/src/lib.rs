pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: RoomRegistry,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: RoomRegistry, config: Config, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            metrics,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/rooms/generate", post(handlers::generate_room_id))
        .route("/rooms/:id", get(handlers::room_status))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}
