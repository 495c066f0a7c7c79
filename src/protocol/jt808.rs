use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tracing::warn;

/// Frames are bracketed by this marker and must not contain it internally.
pub const FRAME_MARKER: u8 = 0x7e;
const ESCAPE_MARKER: u8 = 0x7d;

const SUB_PACKAGE_FLAG: u16 = 0x2000;
const BODY_LENGTH_MASK: u16 = 0x03ff;

/// A decoded JT808 frame. `phone` is the 12-digit BCD terminal phone
/// rendered as a decimal string; it is the canonical device key.
#[derive(Debug, Clone)]
pub struct Jt808Frame {
    pub msg_id: u16,
    pub body_attr: u16,
    pub phone: String,
    pub serial: u16,
    pub total_packets: u16,
    pub current_packet: u16,
    pub body: Vec<u8>,
}

impl Jt808Frame {
    #[allow(dead_code)]
    pub fn is_sub_packaged(&self) -> bool {
        self.body_attr & SUB_PACKAGE_FLAG != 0
    }

    /// Body length as declared in the low 10 bits of the attribute word.
    #[allow(dead_code)]
    pub fn declared_body_length(&self) -> usize {
        (self.body_attr & BODY_LENGTH_MASK) as usize
    }
}

/// Reverses the 0x7E/0x7D escape discipline. A trailing lone 0x7D or an
/// unknown escape byte is kept verbatim rather than rejected.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESCAPE_MARKER && i + 1 < data.len() {
            match data[i + 1] {
                0x01 => {
                    out.push(ESCAPE_MARKER);
                    i += 2;
                    continue;
                }
                0x02 => {
                    out.push(FRAME_MARKER);
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Applies the escape discipline: 0x7E -> 0x7D 0x02, 0x7D -> 0x7D 0x01.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            FRAME_MARKER => out.extend_from_slice(&[ESCAPE_MARKER, 0x02]),
            ESCAPE_MARKER => out.extend_from_slice(&[ESCAPE_MARKER, 0x01]),
            _ => out.push(b),
        }
    }
    out
}

/// XOR of all header+body bytes.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Decodes one marker-bracketed frame. A checksum mismatch is logged but the
/// frame is still returned: the upstream platform is the authority and
/// dropping the frame here would also drop it from our own view.
pub fn parse_frame(data: &[u8]) -> Result<Jt808Frame> {
    if data.len() < 2 || data[0] != FRAME_MARKER || data[data.len() - 1] != FRAME_MARKER {
        bail!("invalid frame format or missing 0x7e markers");
    }

    let unescaped = unescape(&data[1..data.len() - 1]);
    // Minimum: 12-byte header + checksum.
    if unescaped.len() < 13 {
        bail!("frame too short after unescaping: {} bytes", unescaped.len());
    }

    let content = &unescaped[..unescaped.len() - 1];
    let received = unescaped[unescaped.len() - 1];
    let expected = checksum(content);
    if received != expected {
        warn!(
            "[JT808] checksum mismatch: got 0x{:02x}, expected 0x{:02x}",
            received, expected
        );
    }

    let mut buf = content;
    let msg_id = buf.get_u16();
    let body_attr = buf.get_u16();
    let mut phone_bcd = [0u8; 6];
    buf.copy_to_slice(&mut phone_bcd);
    let phone = bcd_to_phone(&phone_bcd);
    let serial = buf.get_u16();

    let (total_packets, current_packet) = if body_attr & SUB_PACKAGE_FLAG != 0 {
        if content.len() < 16 {
            bail!("sub-packaged frame header too short");
        }
        (buf.get_u16(), buf.get_u16())
    } else {
        (1, 1)
    };

    Ok(Jt808Frame {
        msg_id,
        body_attr,
        phone,
        serial,
        total_packets,
        current_packet,
        body: buf.to_vec(),
    })
}

/// Builds a complete outbound frame: header + body + checksum, escaped and
/// bracketed. Outbound commands never sub-package.
pub fn build_frame(msg_id: u16, phone: &str, serial: u16, body: &[u8]) -> Vec<u8> {
    let mut content = BytesMut::with_capacity(13 + body.len());
    content.put_u16(msg_id);
    content.put_u16(body.len() as u16 & BODY_LENGTH_MASK);
    content.put_slice(&phone_to_bcd(phone));
    content.put_u16(serial);
    content.put_slice(body);

    let sum = checksum(&content);
    content.put_u8(sum);

    let mut frame = Vec::with_capacity(content.len() + 2);
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&escape(&content));
    frame.push(FRAME_MARKER);
    frame
}

/// Six BCD bytes, left-zero-padded to 12 decimal digits.
pub fn phone_to_bcd(phone: &str) -> [u8; 6] {
    let padded = format!("{:0>12}", phone);
    let tail = &padded[padded.len() - 12..];
    let mut bcd = [0u8; 6];
    if let Ok(decoded) = hex::decode(tail) {
        bcd.copy_from_slice(&decoded);
    } else {
        warn!("[JT808] non-decimal phone number {:?}", phone);
    }
    bcd
}

pub fn bcd_to_phone(bcd: &[u8]) -> String {
    hex::encode(bcd)
}

/// Process-wide message serial: a counter seeded once from a
/// cryptographically strong generator.
pub fn next_serial() -> u16 {
    static SERIAL: OnceLock<AtomicU16> = OnceLock::new();
    SERIAL
        .get_or_init(|| AtomicU16::new(rand::thread_rng().gen()))
        .fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x7e],
            vec![0x7d],
            vec![0x7e, 0x7d, 0x7e, 0x7d],
            vec![0x00, 0x7d, 0x01, 0x7d, 0x02, 0x7e, 0xff],
            (0u8..=255).collect(),
        ];
        for case in cases {
            let escaped = escape(&case);
            assert!(
                !escaped.contains(&FRAME_MARKER),
                "escape must never emit 0x7e"
            );
            assert_eq!(unescape(&escaped), case);
        }
    }

    #[test]
    fn test_checksum_is_xor() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xab]), 0xab);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), 0x00);
        assert_eq!(checksum(&[0xff, 0x0f]), 0xf0);
    }

    #[test]
    fn test_build_parse_symmetry() {
        let body = vec![0x12, 0x34, 0x7e, 0x7d, 0x00];
        let raw = build_frame(0x8801, "123456789012", 42, &body);
        assert_eq!(raw[0], FRAME_MARKER);
        assert_eq!(raw[raw.len() - 1], FRAME_MARKER);

        let frame = parse_frame(&raw).unwrap();
        assert_eq!(frame.msg_id, 0x8801);
        assert_eq!(frame.phone, "123456789012");
        assert_eq!(frame.serial, 42);
        assert_eq!(frame.body, body);
        assert_eq!(frame.total_packets, 1);
        assert_eq!(frame.current_packet, 1);
        assert!(!frame.is_sub_packaged());
    }

    #[test]
    fn test_checksum_precedes_closing_marker() {
        let raw = build_frame(0x0002, "013800138000", 7, &[]);
        let unescaped = unescape(&raw[1..raw.len() - 1]);
        let content = &unescaped[..unescaped.len() - 1];
        assert_eq!(unescaped[unescaped.len() - 1], checksum(content));
    }

    #[test]
    fn test_rejects_short_and_unmarked_frames() {
        assert!(parse_frame(&[]).is_err());
        assert!(parse_frame(&[0x7e]).is_err());
        assert!(parse_frame(&[0x01, 0x02, 0x03]).is_err());
        // 12 unescaped bytes: one short of header + checksum.
        let mut short = vec![0x7e];
        short.extend_from_slice(&[0u8; 12]);
        short.push(0x7e);
        assert!(parse_frame(&short).is_err());
    }

    #[test]
    fn test_sub_packaged_header() {
        // Hand-build a sub-packaged frame: attr bit 13 set, counters 3/2.
        let mut content = BytesMut::new();
        content.put_u16(0x0801);
        content.put_u16(SUB_PACKAGE_FLAG | 4);
        content.put_slice(&phone_to_bcd("123456789012"));
        content.put_u16(9);
        content.put_u16(3);
        content.put_u16(2);
        content.put_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let sum = checksum(&content);
        content.put_u8(sum);

        let mut raw = vec![FRAME_MARKER];
        raw.extend_from_slice(&escape(&content));
        raw.push(FRAME_MARKER);

        let frame = parse_frame(&raw).unwrap();
        assert!(frame.is_sub_packaged());
        assert_eq!(frame.total_packets, 3);
        assert_eq!(frame.current_packet, 2);
        assert_eq!(frame.body, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(frame.declared_body_length(), 4);
    }

    #[test]
    fn test_checksum_mismatch_is_tolerated() {
        let mut raw = build_frame(0x0002, "013800138000", 7, &[]);
        // Corrupt the checksum byte (second to last, not escaped here).
        let idx = raw.len() - 2;
        raw[idx] ^= 0xff;
        let frame = parse_frame(&raw).unwrap();
        assert_eq!(frame.msg_id, 0x0002);
    }

    #[test]
    fn test_phone_bcd_padding() {
        assert_eq!(phone_to_bcd("13800138000"), [0x01, 0x38, 0x00, 0x13, 0x80, 0x00]);
        assert_eq!(bcd_to_phone(&phone_to_bcd("13800138000")), "013800138000");
        assert_eq!(phone_to_bcd("12"), [0, 0, 0, 0, 0, 0x12]);
    }

    #[test]
    fn test_serial_counter_advances() {
        let a = next_serial();
        let b = next_serial();
        assert_eq!(b, a.wrapping_add(1));
    }
}
