mod config;
mod dispatch;
mod fanout;
mod media;
mod protocol;
mod proxy;
mod registry;
mod snapshot;
mod types;
mod web;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use fanout::MediaHub;
use media::assembler::VideoAssembler;
use registry::DeviceRegistry;
use snapshot::SnapshotStore;
use types::{AppState, SessionStore, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("config.json")?;

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting JT808 proxy");
    info!(
        "Listening: {}  Proxying: {}",
        config.listen_addr, config.platform_addr
    );

    let state: SharedState = Arc::new(AppState {
        registry: DeviceRegistry::new(),
        snapshots: SnapshotStore::new(),
        sessions: SessionStore::new(),
        config: config.clone(),
    });

    let hub = MediaHub::new(256);
    let video = Arc::new(VideoAssembler::new(hub.clone()));

    // HTTP control surface.
    let http_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = web::server::serve(http_state).await {
            error!("HTTP server error: {}", e);
        }
    });

    // JT1078 media ingest.
    let media_config = config.clone();
    let media_video = video.clone();
    tokio::spawn(async move {
        if let Err(e) = media::run_media_server(media_config, media_video, hub).await {
            error!("[VIDEO] media server error: {}", e);
        }
    });

    // Background sweeps for half-finished snapshots and video groups.
    let gc_state = state.clone();
    tokio::spawn(async move {
        gc_state.snapshots.run_cleanup().await;
    });
    let gc_video = video.clone();
    tokio::spawn(async move {
        gc_video.run_cleanup().await;
    });

    // Device-facing proxy; failure to bind is fatal.
    let proxy_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = proxy::run_proxy(proxy_state).await {
            error!("[JT808] proxy error: {}", e);
            std::process::exit(1);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
