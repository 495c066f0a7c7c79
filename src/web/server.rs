use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::handlers;
use crate::types::SharedState;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/jt808/devices", get(handlers::list_devices))
        .route("/api/v1/jt808/call/start", post(handlers::start_call))
        .route("/api/v1/jt808/call/control", post(handlers::control_call))
        .route("/api/v1/jt808/call/status/{phone}", get(handlers::call_status))
        .route("/api/v1/jt808/calls", get(handlers::list_calls))
        .route("/api/v1/jt808/video/start", post(handlers::start_video))
        .route("/api/v1/jt808/video/control", post(handlers::control_video))
        .route("/api/v1/jt808/video/sessions", get(handlers::list_video_sessions))
        .route("/api/v1/jt808/snapshot", get(handlers::capture_snapshot))
        .route("/health", get(handlers::health))
        .with_state(state)
}

pub async fn serve(state: SharedState) -> Result<()> {
    let addr = state.config.http_bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP control surface listening on {}", addr);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
