use tracing::debug;

/// Fixed prefix of every JT1078 media packet: "01cd" in ASCII.
pub const MAGIC: [u8; 4] = [0x30, 0x31, 0x63, 0x64];

/// Minimum bytes required before the header can be parsed.
pub const HEADER_LEN: usize = 28;

/// Payloads above this are treated as stream desync, not data.
pub const MAX_PAYLOAD: usize = 8192;

pub const DATA_TYPE_IFRAME: u8 = 0;
#[allow(dead_code)]
pub const DATA_TYPE_PFRAME: u8 = 1;
pub const DATA_TYPE_BFRAME: u8 = 2;
pub const DATA_TYPE_AUDIO: u8 = 3;
pub const DATA_TYPE_TRANSPARENT: u8 = 4;

pub const SUB_PACKAGE_ATOMIC: u8 = 0;
pub const SUB_PACKAGE_FIRST: u8 = 1;
pub const SUB_PACKAGE_LAST: u8 = 2;
pub const SUB_PACKAGE_MIDDLE: u8 = 3;

/// One parsed JT1078 media packet.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub sequence: u16,
    pub sim: String,
    pub channel: u8,
    pub data_type: u8,
    pub sub_type: u8,
    /// Device timestamp; zero for transparent data which carries none.
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl MediaFrame {
    pub fn is_video(&self) -> bool {
        self.data_type <= DATA_TYPE_BFRAME
    }

    pub fn is_audio(&self) -> bool {
        self.data_type == DATA_TYPE_AUDIO
    }
}

/// Result of scanning the stream buffer for the next packet.
#[derive(Debug)]
pub enum Extraction {
    /// A packet was parsed; drop `consumed` bytes from the buffer.
    Frame { frame: MediaFrame, consumed: usize },
    /// Garbage or a poisoned header; drop `0` bytes and rescan.
    Skip(usize),
    /// Not enough buffered bytes yet.
    Incomplete,
}

/// Locates and decodes the next media packet in `buffer`.
///
/// The header layout after the magic: 2 reserved bytes, u16 sequence, 6-byte
/// BCD SIM, logical channel, then a split byte carrying `dataType` in the
/// high nibble and `subPackageType` in the low nibble. Non-transparent data
/// is followed by an 8-byte timestamp; video additionally by 4 bytes of
/// frame-interval timing. A big-endian u16 payload length closes the header.
pub fn extract_frame(buffer: &[u8]) -> Extraction {
    let header_idx = match find_magic(buffer) {
        Some(idx) => idx,
        None => {
            // Keep a tail in case the magic straddles the read boundary.
            if buffer.len() > MAGIC.len() {
                return Extraction::Skip(buffer.len() - MAGIC.len());
            }
            return Extraction::Incomplete;
        }
    };

    if buffer.len() - header_idx < HEADER_LEN {
        return Extraction::Incomplete;
    }

    let frame_data = &buffer[header_idx..];
    let split = frame_data[15];
    let data_type = (split & 0xf0) >> 4;
    let sub_type = split & 0x0f;

    let mut offset = 16;
    let mut timestamp = 0u64;
    if data_type != DATA_TYPE_TRANSPARENT {
        if frame_data.len() < offset + 8 {
            return Extraction::Incomplete;
        }
        timestamp = u64::from_be_bytes(frame_data[offset..offset + 8].try_into().unwrap());
        offset += 8;
    }
    if data_type <= DATA_TYPE_BFRAME {
        if frame_data.len() < offset + 4 {
            return Extraction::Incomplete;
        }
        offset += 4;
    }

    if frame_data.len() < offset + 2 {
        return Extraction::Incomplete;
    }
    let payload_len = u16::from_be_bytes([frame_data[offset], frame_data[offset + 1]]) as usize;
    offset += 2;

    if payload_len > MAX_PAYLOAD {
        debug!(
            "[VIDEO] implausible payload length {}, resynchronising",
            payload_len
        );
        return Extraction::Skip(header_idx + HEADER_LEN);
    }

    let total = offset + payload_len;
    if frame_data.len() < total {
        return Extraction::Incomplete;
    }

    let frame = MediaFrame {
        sequence: u16::from_be_bytes([frame_data[6], frame_data[7]]),
        sim: hex::encode(&frame_data[8..14]),
        channel: frame_data[14],
        data_type,
        sub_type,
        timestamp,
        payload: frame_data[offset..total].to_vec(),
    };

    Extraction::Frame {
        frame,
        consumed: header_idx + total,
    }
}

fn find_magic(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < MAGIC.len() {
        return None;
    }
    (0..=buffer.len() - MAGIC.len()).find(|&i| buffer[i..i + MAGIC.len()] == MAGIC)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a wire-format media packet for tests.
    pub(crate) fn media_packet(
        channel: u8,
        data_type: u8,
        sub_type: u8,
        sequence: u16,
        timestamp: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&[0x81, 0x62]);
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x38, 0x00, 0x13, 0x80, 0x00]);
        out.push(channel);
        out.push((data_type << 4) | (sub_type & 0x0f));
        if data_type != DATA_TYPE_TRANSPARENT {
            out.extend_from_slice(&timestamp.to_be_bytes());
        }
        if data_type <= DATA_TYPE_BFRAME {
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_extract_video_frame() {
        let raw = media_packet(1, DATA_TYPE_IFRAME, SUB_PACKAGE_ATOMIC, 77, 1234, &[9, 8, 7]);
        match extract_frame(&raw) {
            Extraction::Frame { frame, consumed } => {
                assert_eq!(consumed, raw.len());
                assert_eq!(frame.channel, 1);
                assert_eq!(frame.data_type, DATA_TYPE_IFRAME);
                assert_eq!(frame.sub_type, SUB_PACKAGE_ATOMIC);
                assert_eq!(frame.sequence, 77);
                assert_eq!(frame.timestamp, 1234);
                assert_eq!(frame.sim, "013800138000");
                assert_eq!(frame.payload, vec![9, 8, 7]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_audio_frame_has_no_timing_extension() {
        let raw = media_packet(1, DATA_TYPE_AUDIO, SUB_PACKAGE_ATOMIC, 5, 99, &[1; 160]);
        // 16 header + 8 timestamp + 2 length + payload.
        assert_eq!(raw.len(), 26 + 160);
        match extract_frame(&raw) {
            Extraction::Frame { frame, consumed } => {
                assert_eq!(consumed, raw.len());
                assert!(frame.is_audio());
                assert_eq!(frame.timestamp, 99);
                assert_eq!(frame.payload.len(), 160);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_before_magic_is_skipped_then_parsed() {
        let mut raw = vec![0xaa, 0xbb, 0xcc];
        raw.extend_from_slice(&media_packet(2, DATA_TYPE_PFRAME, SUB_PACKAGE_ATOMIC, 1, 7, &[5]));
        match extract_frame(&raw) {
            Extraction::Frame { frame, consumed } => {
                assert_eq!(consumed, raw.len());
                assert_eq!(frame.channel, 2);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_pure_garbage_keeps_four_byte_tail() {
        let raw = vec![0u8; 100];
        match extract_frame(&raw) {
            Extraction::Skip(n) => assert_eq!(n, 96),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_frame_waits_for_more() {
        let raw = media_packet(1, DATA_TYPE_IFRAME, SUB_PACKAGE_FIRST, 3, 50, &[1, 2, 3, 4]);
        for cut in [2, 10, 20, raw.len() - 1] {
            assert!(
                matches!(extract_frame(&raw[..cut]), Extraction::Incomplete),
                "cut at {} should be incomplete",
                cut
            );
        }
    }

    #[test]
    fn test_oversize_payload_resyncs_past_header() {
        let mut raw = media_packet(1, DATA_TYPE_IFRAME, SUB_PACKAGE_ATOMIC, 3, 50, &[]);
        // Poison the length field (offset 16 + 8 ts + 4 timing = 28, len at 26..28).
        let len_at = raw.len() - 2;
        raw[len_at..].copy_from_slice(&(MAX_PAYLOAD as u16 + 1).to_be_bytes());
        match extract_frame(&raw) {
            Extraction::Skip(n) => assert_eq!(n, HEADER_LEN),
            other => panic!("expected skip, got {:?}", other),
        }
    }
}
