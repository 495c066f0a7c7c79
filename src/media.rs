//! Listener for JT1078 media streams. Devices dial in here after a 0x9101
//! and push interleaved audio/video packets over plain TCP.

pub mod assembler;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::fanout::MediaHub;
use crate::protocol::jt1078::{self, Extraction, MediaFrame};
use self::assembler::VideoAssembler;

/// One G.711A audio unit is at most 320 bytes (40 ms at 8 kHz).
const MAX_AUDIO_PAYLOAD: usize = 320;

/// Desync guard: a buffer growing past this is cut down to its tail.
const BUFFER_TRIM_LIMIT: usize = 32 * 1024;
const BUFFER_TRIM_KEEP: usize = 1024;

pub async fn run_media_server(
    config: AppConfig,
    video: Arc<VideoAssembler>,
    hub: MediaHub,
) -> Result<()> {
    let bind_addr = config.media_bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("[VIDEO] media listener on {}", bind_addr);

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                info!("[VIDEO] new media connection from {}", addr);
                let video = video.clone();
                let hub = hub.clone();
                tokio::spawn(async move {
                    handle_media_connection(socket, addr, video, hub).await;
                });
            }
            Err(e) => {
                error!("[VIDEO] media accept error: {}", e);
            }
        }
    }
}

async fn handle_media_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    video: Arc<VideoAssembler>,
    hub: MediaHub,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut read_buf = vec![0u8; 8192];

    loop {
        let n = match socket.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("[VIDEO] media read error from {}: {}", addr, e);
                break;
            }
        };
        buffer.extend_from_slice(&read_buf[..n]);

        loop {
            match jt1078::extract_frame(&buffer) {
                Extraction::Frame { frame, consumed } => {
                    buffer.drain(..consumed);
                    process_frame(frame, &video, &hub).await;
                }
                Extraction::Skip(skip) => {
                    buffer.drain(..skip);
                }
                Extraction::Incomplete => break,
            }
            if buffer.len() > BUFFER_TRIM_LIMIT {
                debug!("[VIDEO] media buffer from {} desynced, trimming", addr);
                buffer.drain(..buffer.len() - BUFFER_TRIM_KEEP);
            }
        }
    }

    info!("[VIDEO] media connection closed: {}", addr);
}

async fn process_frame(frame: MediaFrame, video: &Arc<VideoAssembler>, hub: &MediaHub) {
    if frame.is_video() {
        video.handle_frame(frame).await;
        return;
    }
    if frame.is_audio() {
        if frame.payload.is_empty() {
            return;
        }
        let mut payload = frame.payload;
        payload.truncate(MAX_AUDIO_PAYLOAD);
        let duration = audio_duration(payload.len());
        hub.publish_audio(frame.channel, payload, duration);
        return;
    }
    debug!(
        "[VIDEO] ignoring transparent media frame on channel {}",
        frame.channel
    );
}

/// Playback duration of a G.711A payload at 8 kHz, one byte per sample,
/// clamped to the frame sizes devices actually send.
fn audio_duration(len: usize) -> f32 {
    let duration = len as f32 / 8000.0;
    if duration < 0.02 {
        0.02
    } else if duration > 0.06 {
        0.04
    } else {
        duration
    }
}
