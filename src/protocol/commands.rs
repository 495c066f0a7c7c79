//! Builders for the outbound command frames the proxy originates.

use bytes::{BufMut, BytesMut};

use super::jt808::{build_frame, next_serial};
use super::{
    AUTH_CODE, MSG_IMAGE_CAPTURE, MSG_MEDIA_CONTROL, MSG_MEDIA_START, MSG_MULTIMEDIA_ACK,
    MSG_PLATFORM_RESPONSE, MSG_REGISTER_RESPONSE, MSG_SET_PARAMETERS,
};

/// Logical channel used for the audio intercom pseudo-camera.
pub const INTERCOM_CHANNEL: u8 = 0x24;

pub const MEDIA_CMD_STOP: u8 = 0;
#[allow(dead_code)]
pub const MEDIA_CMD_SWITCH: u8 = 1;
#[allow(dead_code)]
pub const MEDIA_CMD_PAUSE: u8 = 2;
pub const MEDIA_CMD_RESUME: u8 = 3;
pub const MEDIA_CMD_HANGUP: u8 = 4;

/// 0x8001 general response: serial of the message being answered, its id,
/// and a result byte (0 = ok).
pub fn general_response(phone: &str, reply_serial: u16, reply_msg_id: u16, result: u8) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(5);
    body.put_u16(reply_serial);
    body.put_u16(reply_msg_id);
    body.put_u8(result);
    build_frame(MSG_PLATFORM_RESPONSE, phone, next_serial(), &body)
}

/// 0x8100 registration response carrying the fixed auth code.
pub fn registration_response(phone: &str, reply_serial: u16, result: u8) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(3 + AUTH_CODE.len());
    body.put_u16(reply_serial);
    body.put_u8(result);
    body.put_slice(AUTH_CODE);
    build_frame(MSG_REGISTER_RESPONSE, phone, next_serial(), &body)
}

/// 0x8800 multimedia upload acknowledgement: multimedia id plus a zero
/// retransmit count on success.
pub fn multimedia_ack(phone: &str, multimedia_id: u32) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(5);
    body.put_u32(multimedia_id);
    body.put_u8(0);
    build_frame(MSG_MULTIMEDIA_ACK, phone, next_serial(), &body)
}

/// 0x8801 single-shot image capture.
#[allow(clippy::too_many_arguments)]
pub fn snapshot_command(
    phone: &str,
    channel: u8,
    count: u16,
    resolution: u8,
    quality: u8,
    brightness: u8,
    contrast: u8,
    saturation: u8,
    chroma: u8,
) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(12);
    body.put_u8(channel);
    body.put_u16(count);
    body.put_u16(0); // shot interval
    body.put_u8(0); // save flag: upload
    body.put_u8(resolution);
    body.put_u8(quality);
    body.put_u8(brightness);
    body.put_u8(contrast);
    body.put_u8(saturation);
    body.put_u8(chroma);
    build_frame(MSG_IMAGE_CAPTURE, phone, next_serial(), &body)
}

/// 0x8103 terminal parameter set carrying the fixed G.711A intercom profile:
/// codec 0x06, mono, 8 kHz, 8-bit, 20 ms (160 byte) frames, output enabled,
/// 64 kbit/s. Sent ahead of the intercom 0x9101.
pub fn audio_parameters(phone: &str) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(17);
    body.put_u8(1); // parameter count
    body.put_u32(0x0076); // audio attributes parameter
    body.put_u8(11); // parameter length
    body.put_u8(0x06); // codec: G.711A
    body.put_u8(1); // channels
    body.put_u8(0); // sample rate: 8 kHz
    body.put_u8(0); // sample width: 8-bit
    body.put_u16(160); // frame length
    body.put_u8(1); // output enable
    body.put_u32(64_000); // bitrate
    build_frame(MSG_SET_PARAMETERS, phone, next_serial(), &body)
}

/// 0x9101 realtime media start, pointing the device at the media ingest
/// endpoint. Video uses channels 1..4 with talk type 0; the audio intercom
/// uses channel 0x24 / data type 2 / sub stream / talk type 0x20.
pub fn media_start(
    phone: &str,
    server_ip: &str,
    tcp_port: u16,
    udp_port: u16,
    channel: u8,
    data_type: u8,
    stream_type: u8,
    talk_type: u8,
) -> Vec<u8> {
    let ip = server_ip.as_bytes();
    let mut body = BytesMut::with_capacity(ip.len() + 9);
    body.put_u8(ip.len() as u8);
    body.put_slice(ip);
    body.put_u16(tcp_port);
    body.put_u16(udp_port);
    body.put_u8(channel);
    body.put_u8(data_type);
    body.put_u8(stream_type);
    body.put_u8(talk_type);
    build_frame(MSG_MEDIA_START, phone, next_serial(), &body)
}

/// 0x9101 preset for live video.
pub fn video_start(phone: &str, server_ip: &str, port: u16, channel: u8, stream_type: u8) -> Vec<u8> {
    media_start(phone, server_ip, port, port, channel, 0, stream_type, 0)
}

/// 0x9101 preset for the audio intercom.
pub fn intercom_start(phone: &str, server_ip: &str, port: u16) -> Vec<u8> {
    media_start(phone, server_ip, port, port, INTERCOM_CHANNEL, 0x02, 0x01, 0x20)
}

/// 0x9102 media stream control.
pub fn media_control(phone: &str, channel: u8, command: u8, close_av: u8, switch_stream: u8) -> Vec<u8> {
    let body = [channel, command, close_av, switch_stream];
    build_frame(MSG_MEDIA_CONTROL, phone, next_serial(), &body)
}
