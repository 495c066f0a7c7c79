//! Dispatch of sniffed JT808 frames: registry upkeep, proxy-side
//! acknowledgements and the snapshot ingest path.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{self, commands, jt808};
use crate::snapshot::PacketOutcome;
use crate::types::SharedState;

/// Handles one frame sniffed on the device leg. Every recognisable frame
/// refreshes the device record; the dispatch table mirrors the messages the
/// proxy cares about and ignores the rest of the traffic it relays.
pub async fn handle_device_frame(
    state: &SharedState,
    raw: &[u8],
    addr: SocketAddr,
    writer: &mpsc::Sender<Vec<u8>>,
) {
    let frame = match jt808::parse_frame(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("[JT808] undecodable frame from {}: {}", addr, e);
            return;
        }
    };
    debug!(
        "[JT808] message 0x{:04x} from {} ({})",
        frame.msg_id, frame.phone, addr
    );
    state.registry.upsert(&frame.phone, addr, writer).await;

    match frame.msg_id {
        protocol::MSG_TERMINAL_REGISTER => handle_registration(&frame, writer).await,
        protocol::MSG_TERMINAL_AUTH => {
            let code = String::from_utf8_lossy(&frame.body).to_string();
            info!("[JT808] device {} offered auth code {:?}", frame.phone, code);
            state.registry.set_auth_code(&frame.phone, code).await;
        }
        protocol::MSG_HEARTBEAT => {
            debug!("[JT808] heartbeat from {}", frame.phone);
        }
        protocol::MSG_LOCATION_REPORT | protocol::MSG_LOCATION_BATCH => {
            debug!(
                "[JT808] location report from {} ({} bytes)",
                frame.phone,
                frame.body.len()
            );
        }
        protocol::MSG_TERMINAL_RESPONSE => handle_terminal_response(&frame),
        protocol::MSG_MULTIMEDIA_UPLOAD => handle_multimedia_upload(state, &frame, writer).await,
        protocol::MSG_CAMERA_RESPONSE => handle_camera_response(&frame),
        other => {
            debug!("[JT808] unhandled message 0x{:04x} from {}", other, frame.phone);
        }
    }
}

/// Handles one frame sniffed on the platform leg. The only state the proxy
/// derives from it is the authentication handshake outcome.
pub async fn handle_platform_frame(state: &SharedState, raw: &[u8]) {
    let frame = match jt808::parse_frame(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("[JT808] undecodable platform frame: {}", e);
            return;
        }
    };

    if frame.msg_id == protocol::MSG_PLATFORM_RESPONSE && frame.body.len() >= 5 {
        let replied_msg_id = u16::from_be_bytes([frame.body[2], frame.body[3]]);
        let result = frame.body[4];
        if result == 0
            && (replied_msg_id == protocol::MSG_TERMINAL_REGISTER
                || replied_msg_id == protocol::MSG_TERMINAL_AUTH)
            && state.registry.set_authenticated(&frame.phone).await
        {
            info!("[JT808] device {} authenticated by platform", frame.phone);
        }
    }
}

/// 0x0100: registration body is province(2), city(2), manufacturer(5),
/// model(20), terminal id(7), plate color(1), plate. Decoded for the log
/// line only; the proxy answers with its own 0x8100 carrying the fixed auth
/// code, in parallel with whatever the platform replies.
async fn handle_registration(frame: &jt808::Jt808Frame, writer: &mpsc::Sender<Vec<u8>>) {
    let body = &frame.body;
    if body.len() >= 29 {
        let manufacturer = String::from_utf8_lossy(&body[4..9]).trim_end_matches('\0').to_string();
        let model = String::from_utf8_lossy(&body[9..29]).trim_end_matches('\0').to_string();
        let plate = if body.len() > 37 {
            String::from_utf8_lossy(&body[37..]).to_string()
        } else {
            String::new()
        };
        info!(
            "[JT808] registration from {}: manufacturer {:?}, model {:?}, plate {:?}",
            frame.phone, manufacturer, model, plate
        );
    } else {
        info!("[JT808] registration from {}", frame.phone);
    }

    let response = commands::registration_response(&frame.phone, frame.serial, 0);
    if writer.send(response).await.is_err() {
        warn!("[JT808] failed to queue registration response for {}", frame.phone);
    }
}

/// 0x0001: confirmation of one of our own outbound commands.
fn handle_terminal_response(frame: &jt808::Jt808Frame) {
    if frame.body.len() < 5 {
        return;
    }
    let reply_serial = u16::from_be_bytes([frame.body[0], frame.body[1]]);
    let reply_msg_id = u16::from_be_bytes([frame.body[2], frame.body[3]]);
    let result = frame.body[4];
    info!(
        "[JT808] terminal response from {} - serial {}, msg 0x{:04x}, result {}",
        frame.phone, reply_serial, reply_msg_id, result
    );
}

/// 0x0805: outcome of a snapshot command.
fn handle_camera_response(frame: &jt808::Jt808Frame) {
    if frame.body.len() < 5 {
        return;
    }
    let reply_serial = u16::from_be_bytes([frame.body[0], frame.body[1]]);
    let result = frame.body[4];
    info!("[CAMERA RESPONSE] serial {}, result {}", reply_serial, result);
    if result != 0 {
        warn!(
            "[CAMERA RESPONSE] device {} rejected snapshot command - error {}",
            frame.phone, result
        );
    }
}

/// 0x0801: one multimedia fragment. The store decides whether to ack.
async fn handle_multimedia_upload(
    state: &SharedState,
    frame: &jt808::Jt808Frame,
    writer: &mpsc::Sender<Vec<u8>>,
) {
    let outcome = state
        .snapshots
        .ingest(&frame.phone, frame.total_packets, frame.current_packet, &frame.body)
        .await;
    let ack = match outcome {
        PacketOutcome::Ack(multimedia_id) => commands::multimedia_ack(&frame.phone, multimedia_id),
        PacketOutcome::MalformedFirst => commands::general_response(
            &frame.phone,
            frame.serial,
            protocol::MSG_MULTIMEDIA_UPLOAD,
            1,
        ),
        PacketOutcome::Buffered => return,
    };
    if writer.send(ack).await.is_err() {
        warn!("[JT808] failed to queue multimedia ack for {}", frame.phone);
    }
}
