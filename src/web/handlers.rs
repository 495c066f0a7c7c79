//! HTTP control surface. Request invariants (channel and command ranges)
//! are checked here before anything touches the core.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::protocol::commands;
use crate::snapshot::SnapshotWait;
use crate::types::{Device, SharedState, VideoSession, VoipCall};

const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 90;
const DEFAULT_SNAPSHOT_RESOLUTION: u8 = 1;

#[derive(Debug, Deserialize)]
pub struct CallStartRequest {
    pub device_phone: String,
    pub caller_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CallControlRequest {
    pub device_phone: String,
    /// 0=stop, 1=switch, 2=pause, 3=resume, 4=hangup.
    pub command: u8,
}

#[derive(Debug, Deserialize)]
pub struct VideoStartRequest {
    pub device_phone: String,
    pub channel: u8,
    /// 0=main, 1=sub.
    #[serde(default)]
    pub stream_type: u8,
}

#[derive(Debug, Deserialize)]
pub struct VideoControlRequest {
    pub device_phone: String,
    pub channel: u8,
    /// 0=stop, 1=switch, 2=pause, 3=resume.
    #[serde(default)]
    pub command: u8,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub device_phone: String,
    pub channel: u8,
    #[serde(default)]
    pub resolution: u8,
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub timeout: u64,
}

fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Looks up a device and applies the shared precondition checks.
async fn ready_device(state: &SharedState, phone: &str, require_auth: bool) -> Result<Device, Response> {
    let Some(device) = state.registry.get(phone).await else {
        return Err(error_response(StatusCode::NOT_FOUND, "Device not found"));
    };
    if require_auth && !device.authenticated {
        return Err(error_response(StatusCode::BAD_REQUEST, "Device not authenticated"));
    }
    Ok(device)
}

pub async fn list_devices(State(state): State<SharedState>) -> Response {
    Json(state.registry.list().await).into_response()
}

pub async fn start_call(
    State(state): State<SharedState>,
    Json(req): Json<CallStartRequest>,
) -> Response {
    info!("[JT808] /call/start for device {}", req.device_phone);

    let device = match ready_device(&state, &req.device_phone, true).await {
        Ok(device) => device,
        Err(response) => return response,
    };
    if device.in_call {
        return error_response(StatusCode::CONFLICT, "Device already in call");
    }
    let Some(writer) = device.conn else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Device connection not available, please retry",
        );
    };

    let ip = state.config.media_server_ip.clone();
    let port = state.config.media_server_port;
    info!("[JT808] intercom endpoint {}:{}", ip, port);

    // The G.711A parameter set goes out ahead of the media start.
    let parameters = commands::audio_parameters(&req.device_phone);
    let start = commands::intercom_start(&req.device_phone, &ip, port);
    if writer.send(parameters).await.is_err() || writer.send(start).await.is_err() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send call command to device",
        );
    }

    let call = VoipCall {
        call_id: generate_id(),
        device_phone: req.device_phone.clone(),
        caller_id: req.caller_id,
        status: "initiated".to_string(),
        start_time: Utc::now(),
    };
    state.registry.set_in_call(&req.device_phone, true).await;
    state.sessions.insert_call(call.clone()).await;
    Json(call).into_response()
}

pub async fn control_call(
    State(state): State<SharedState>,
    Json(req): Json<CallControlRequest>,
) -> Response {
    if req.command > commands::MEDIA_CMD_HANGUP {
        return error_response(StatusCode::BAD_REQUEST, "Invalid command. Use 0-4");
    }

    let device = match ready_device(&state, &req.device_phone, false).await {
        Ok(device) => device,
        Err(response) => return response,
    };
    let Some(writer) = device.conn else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Device connection not available, please retry",
        );
    };

    let frame = commands::media_control(&req.device_phone, commands::INTERCOM_CHANNEL, req.command, 0, 0);
    if writer.send(frame).await.is_err() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send control command to device",
        );
    }

    if req.command == commands::MEDIA_CMD_HANGUP {
        state.registry.set_in_call(&req.device_phone, false).await;
        state.sessions.end_call(&req.device_phone).await;
    }

    Json(json!({
        "message": "Control command sent successfully",
        "command": req.command,
    }))
    .into_response()
}

pub async fn call_status(
    State(state): State<SharedState>,
    Path(phone): Path<String>,
) -> Response {
    match state.sessions.call_for(&phone).await {
        Some(call) => Json(call).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No active call found"),
    }
}

pub async fn list_calls(State(state): State<SharedState>) -> Response {
    Json(state.sessions.list_calls().await).into_response()
}

pub async fn start_video(
    State(state): State<SharedState>,
    Json(req): Json<VideoStartRequest>,
) -> Response {
    info!(
        "[JT808] /video/start for device {}, channel {}",
        req.device_phone, req.channel
    );

    if !(1..=4).contains(&req.channel) {
        return error_response(StatusCode::BAD_REQUEST, "Channel must be between 1 and 4");
    }
    if req.stream_type > 1 {
        return error_response(StatusCode::BAD_REQUEST, "Stream type must be 0 (main) or 1 (sub)");
    }

    let device = match ready_device(&state, &req.device_phone, true).await {
        Ok(device) => device,
        Err(response) => return response,
    };
    let Some(writer) = device.conn else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Device connection not available, please retry",
        );
    };

    let ip = state.config.media_server_ip.clone();
    let port = state.config.media_server_port;
    info!("[JT808] media endpoint {}:{}", ip, port);

    let frame = commands::video_start(&req.device_phone, &ip, port, req.channel, req.stream_type);
    if writer.send(frame).await.is_err() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send video start command to device",
        );
    }

    let session = VideoSession {
        session_id: generate_id(),
        device_phone: req.device_phone,
        channel: req.channel,
        stream_type: req.stream_type,
        status: "initiated".to_string(),
        start_time: Utc::now(),
        media_server: ip,
        media_port: port,
    };
    state.sessions.insert_video(session.clone()).await;
    Json(session).into_response()
}

pub async fn control_video(
    State(state): State<SharedState>,
    Json(req): Json<VideoControlRequest>,
) -> Response {
    info!(
        "[VIDEO CONTROL] device {}, channel {}, command {}",
        req.device_phone, req.channel, req.command
    );

    if !(1..=4).contains(&req.channel) {
        return error_response(StatusCode::BAD_REQUEST, "Channel must be between 1 and 4");
    }
    if req.command > commands::MEDIA_CMD_RESUME {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid command. Use 0=stop, 1=switch, 2=pause, 3=resume",
        );
    }

    let device = match ready_device(&state, &req.device_phone, true).await {
        Ok(device) => device,
        Err(response) => return response,
    };
    let Some(writer) = device.conn else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Device connection not available, please retry",
        );
    };

    let frame = commands::media_control(&req.device_phone, req.channel, req.command, 0, 0);
    if writer.send(frame).await.is_err() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send control command to device",
        );
    }

    if req.command == commands::MEDIA_CMD_STOP {
        state.sessions.stop_video(&req.device_phone, req.channel).await;
    }

    Json(json!({
        "message": "Video control command sent successfully",
        "command": req.command,
        "channel": req.channel,
    }))
    .into_response()
}

pub async fn list_video_sessions(State(state): State<SharedState>) -> Response {
    Json(state.sessions.list_videos().await).into_response()
}

/// Sends an 0x8801 and blocks (polling) until the device has uploaded a
/// complete image or the timeout expires.
pub async fn capture_snapshot(
    State(state): State<SharedState>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    info!(
        "[IMAGE SNAPSHOT] request - device {}, channel {}",
        query.device_phone, query.channel
    );

    if !(1..=4).contains(&query.channel) {
        return error_response(StatusCode::BAD_REQUEST, "Channel must be between 1 and 4");
    }

    let device = match ready_device(&state, &query.device_phone, false).await {
        Ok(device) => device,
        Err(response) => return response,
    };
    if !device.authenticated {
        warn!(
            "[IMAGE SNAPSHOT] device {} not authenticated, proceeding anyway",
            query.device_phone
        );
    }
    let Some(writer) = device.conn else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Device connection not available, please retry",
        );
    };

    let resolution = if query.resolution == 0 {
        DEFAULT_SNAPSHOT_RESOLUTION
    } else {
        query.resolution
    };
    let timeout = if query.timeout == 0 {
        DEFAULT_SNAPSHOT_TIMEOUT_SECS
    } else {
        query.timeout
    };

    // Drop any stale half-finished upload for this (phone, channel) so the
    // new capture cannot inherit its chunks.
    state
        .snapshots
        .preflight_cleanup(&query.device_phone, query.channel)
        .await;

    let frame = commands::snapshot_command(
        &query.device_phone,
        query.channel,
        1,
        resolution,
        query.quality,
        0,
        0,
        0,
        0,
    );
    if writer.send(frame).await.is_err() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send image capture command",
        );
    }
    info!(
        "[IMAGE SNAPSHOT] capture command sent - resolution {}, quality {}, timeout {}s",
        resolution, query.quality, timeout
    );

    let wait = state
        .snapshots
        .wait_for(&query.device_phone, query.channel, Duration::from_secs(timeout))
        .await;

    match wait {
        SnapshotWait::Complete(snapshot) => {
            info!(
                "[IMAGE SNAPSHOT] success - device {}, {} bytes",
                snapshot.device_phone,
                snapshot.image.len()
            );
            Json(json!({
                "status": "success",
                "image_base64": BASE64.encode(&snapshot.image),
                "image_size": snapshot.image.len(),
                "chunks_received": snapshot.chunks_received,
                "capture_time": snapshot.capture_time.to_rfc3339(),
                "device_phone": snapshot.device_phone,
                "channel": snapshot.channel,
            }))
            .into_response()
        }
        SnapshotWait::TimedOut {
            chunks_received,
            expected_chunks,
        } => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({
                "status": "timeout",
                "error": "Timeout waiting for complete image",
                "chunks_received": chunks_received,
                "expected_chunks": expected_chunks,
            })),
        )
            .into_response(),
        SnapshotWait::NoData => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({
                "status": "timeout",
                "error": "No response from device",
            })),
        )
            .into_response(),
    }
}

pub async fn health(State(state): State<SharedState>) -> Response {
    let (devices, connections) = state.registry.counts().await;
    Json(json!({
        "status": "ok",
        "devices": devices,
        "connections": connections,
    }))
    .into_response()
}
