//! Reassembly of 0x0801 multimedia uploads into complete images, with a
//! polling wait path for HTTP callers.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// The first packet carries this much metadata ahead of the image bytes.
const FIRST_PACKET_META_LEN: usize = 36;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_LIMIT: Duration = Duration::from_secs(120);

/// Outcome of ingesting one multimedia packet; tells the dispatcher which
/// acknowledgement to send.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Acknowledge with 0x8800 for this multimedia id.
    Ack(u32),
    /// First packet shorter than its metadata block; answer with an error.
    MalformedFirst,
    /// Out-of-order packet parked until its first packet arrives. No ack.
    Buffered,
}

/// One in-flight multimedia upload keyed by the device-chosen id.
#[derive(Debug)]
pub struct SnapshotAssembly {
    pub multimedia_id: u32,
    pub device_phone: String,
    pub channel: u8,
    pub expected_chunks: u16,
    pub received_chunks: u16,
    pub total_size: usize,
    pub complete: bool,
    pub capture_time: DateTime<Utc>,
    chunks: BTreeMap<u16, Vec<u8>>,
    image: Vec<u8>,
    created: Instant,
    last_chunk: Instant,
}

/// A finished image handed to the HTTP caller.
#[derive(Debug)]
pub struct CompletedSnapshot {
    pub device_phone: String,
    pub channel: u8,
    pub image: Vec<u8>,
    pub chunks_received: u16,
    pub capture_time: DateTime<Utc>,
}

#[derive(Debug)]
pub enum SnapshotWait {
    Complete(CompletedSnapshot),
    /// Timeout with a matching assembly still in flight.
    TimedOut {
        chunks_received: u16,
        expected_chunks: u16,
    },
    /// Timeout and the device never sent a packet.
    NoData,
}

struct PendingChunk {
    body: Vec<u8>,
    total_packets: u16,
    current_packet: u16,
    received: Instant,
}

#[derive(Default)]
pub struct SnapshotStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    assemblies: HashMap<u32, SnapshotAssembly>,
    /// Packets that arrived before their first packet, keyed by phone.
    early_chunks: HashMap<String, Vec<PendingChunk>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one 0x0801 packet. Packet 1 carries 36 bytes of metadata
    /// (multimedia id, type, format, channel) ahead of the image bytes and
    /// opens the assembly; later packets are matched to the most recent
    /// incomplete assembly of the same phone.
    pub async fn ingest(&self, phone: &str, total: u16, current: u16, body: &[u8]) -> PacketOutcome {
        debug!(
            "[IMAGE SNAPSHOT] multimedia upload from {}: packet {}/{}, {} bytes",
            phone,
            current,
            total,
            body.len()
        );
        if current == 1 {
            self.ingest_first(phone, total, body).await
        } else {
            self.ingest_subsequent(phone, total, current, body).await
        }
    }

    async fn ingest_first(&self, phone: &str, total: u16, body: &[u8]) -> PacketOutcome {
        if body.len() < FIRST_PACKET_META_LEN {
            warn!(
                "[IMAGE SNAPSHOT] first multimedia packet too short: {} bytes",
                body.len()
            );
            return PacketOutcome::MalformedFirst;
        }

        let multimedia_id = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let media_type = body[4];
        let format = body[5];
        let channel = body[7];

        if media_type != 0 {
            debug!(
                "[IMAGE SNAPSHOT] ignoring non-image multimedia type {} from {}",
                media_type, phone
            );
            return PacketOutcome::Ack(multimedia_id);
        }
        if format != 0 {
            warn!(
                "[IMAGE SNAPSHOT] unexpected image format {} from {}, expected JPEG",
                format, phone
            );
        }

        let now = Instant::now();
        let mut assembly = SnapshotAssembly {
            multimedia_id,
            device_phone: phone.to_string(),
            channel,
            expected_chunks: total,
            received_chunks: 1,
            total_size: body.len() - FIRST_PACKET_META_LEN,
            complete: false,
            capture_time: Utc::now(),
            chunks: BTreeMap::new(),
            image: Vec::new(),
            created: now,
            last_chunk: now,
        };
        assembly
            .chunks
            .insert(1, body[FIRST_PACKET_META_LEN..].to_vec());

        let mut inner = self.inner.lock().await;

        // Absorb any chunks that raced ahead of this first packet.
        if let Some(pending) = inner.early_chunks.remove(phone) {
            for chunk in pending {
                if chunk.total_packets == total && !assembly.chunks.contains_key(&chunk.current_packet) {
                    assembly.received_chunks += 1;
                    assembly.total_size += chunk.body.len();
                    assembly.chunks.insert(chunk.current_packet, chunk.body);
                }
            }
        }

        if assembly.received_chunks >= assembly.expected_chunks {
            try_assemble(&mut assembly);
        }
        inner.assemblies.insert(multimedia_id, assembly);
        PacketOutcome::Ack(multimedia_id)
    }

    async fn ingest_subsequent(
        &self,
        phone: &str,
        total: u16,
        current: u16,
        body: &[u8],
    ) -> PacketOutcome {
        let mut inner = self.inner.lock().await;

        // Attach to the most recent incomplete assembly of this phone.
        let target = inner
            .assemblies
            .values()
            .filter(|a| a.device_phone == phone && !a.complete)
            .max_by_key(|a| a.created)
            .map(|a| a.multimedia_id);

        let Some(multimedia_id) = target else {
            inner
                .early_chunks
                .entry(phone.to_string())
                .or_default()
                .push(PendingChunk {
                    body: body.to_vec(),
                    total_packets: total,
                    current_packet: current,
                    received: Instant::now(),
                });
            return PacketOutcome::Buffered;
        };

        let Some(assembly) = inner.assemblies.get_mut(&multimedia_id) else {
            return PacketOutcome::Buffered;
        };
        if assembly.chunks.contains_key(&current) {
            debug!(
                "[IMAGE SNAPSHOT] duplicate packet {} for multimedia id {}",
                current, multimedia_id
            );
            return PacketOutcome::Ack(multimedia_id);
        }

        assembly.chunks.insert(current, body.to_vec());
        assembly.received_chunks += 1;
        assembly.total_size += body.len();
        assembly.last_chunk = Instant::now();

        if assembly.received_chunks >= assembly.expected_chunks {
            try_assemble(assembly);
        }
        PacketOutcome::Ack(multimedia_id)
    }

    /// Deletes any incomplete assembly for (phone, channel) before a new
    /// capture so successive requests cannot cross-contaminate.
    pub async fn preflight_cleanup(&self, phone: &str, channel: u8) {
        let mut inner = self.inner.lock().await;
        inner.assemblies.retain(|id, a| {
            let stale = a.device_phone == phone && a.channel == channel && !a.complete;
            if stale {
                info!("[IMAGE SNAPSHOT] cleaned up incomplete snapshot id {}", id);
            }
            !stale
        });
    }

    /// Removes and returns a completed assembly for (phone, channel). The
    /// copy-out and delete happen under one lock so the caller gets a stable
    /// image.
    pub async fn take_complete(&self, phone: &str, channel: u8) -> Option<CompletedSnapshot> {
        let mut inner = self.inner.lock().await;
        let id = inner
            .assemblies
            .iter()
            .find(|(_, a)| a.device_phone == phone && a.channel == channel && a.complete)
            .map(|(id, _)| *id)?;
        let assembly = inner.assemblies.remove(&id)?;
        Some(CompletedSnapshot {
            device_phone: assembly.device_phone,
            channel: assembly.channel,
            image: assembly.image,
            chunks_received: assembly.received_chunks,
            capture_time: assembly.capture_time,
        })
    }

    async fn partial_counts(&self, phone: &str, channel: u8) -> Option<(u16, u16)> {
        let inner = self.inner.lock().await;
        inner
            .assemblies
            .values()
            .find(|a| a.device_phone == phone && a.channel == channel)
            .map(|a| (a.received_chunks, a.expected_chunks))
    }

    /// Polls for a completed capture until the timeout expires. Expiry does
    /// not cancel the underlying assembly; late chunks are absorbed by GC.
    pub async fn wait_for(&self, phone: &str, channel: u8, timeout: Duration) -> SnapshotWait {
        let deadline = Instant::now() + timeout;
        let mut ticker = time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Some(done) = self.take_complete(phone, channel).await {
                return SnapshotWait::Complete(done);
            }
            if Instant::now() >= deadline {
                return match self.partial_counts(phone, channel).await {
                    Some((received, expected)) => SnapshotWait::TimedOut {
                        chunks_received: received,
                        expected_chunks: expected,
                    },
                    None => SnapshotWait::NoData,
                };
            }
        }
    }

    /// Drops incomplete assemblies and parked chunks idle for over two
    /// minutes.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.assemblies.retain(|id, a| {
            let expired = !a.complete && now.duration_since(a.last_chunk) > IDLE_LIMIT;
            if expired {
                debug!(
                    "[IMAGE SNAPSHOT] expired snapshot id {} for device {}",
                    id, a.device_phone
                );
            }
            !expired
        });
        for pending in inner.early_chunks.values_mut() {
            pending.retain(|c| now.duration_since(c.received) <= IDLE_LIMIT);
        }
        inner.early_chunks.retain(|_, pending| !pending.is_empty());
    }

    /// Background sweep; spawned once at startup.
    pub async fn run_cleanup(&self) {
        let mut ticker = time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

fn try_assemble(assembly: &mut SnapshotAssembly) {
    for index in 1..=assembly.expected_chunks {
        if !assembly.chunks.contains_key(&index) {
            warn!(
                "[IMAGE SNAPSHOT] missing chunk {} while assembling multimedia id {}",
                index, assembly.multimedia_id
            );
            return;
        }
    }
    let mut image = Vec::with_capacity(assembly.total_size);
    for index in 1..=assembly.expected_chunks {
        image.extend_from_slice(&assembly.chunks[&index]);
    }
    assembly.total_size = image.len();
    assembly.image = image;
    assembly.complete = true;
    info!(
        "[IMAGE SNAPSHOT] capture complete - id {}, device {}, {} bytes in {} chunks",
        assembly.multimedia_id, assembly.device_phone, assembly.total_size, assembly.received_chunks
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    /// First-packet body: 36 bytes of metadata followed by image bytes.
    fn first_packet(multimedia_id: u32, channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; FIRST_PACKET_META_LEN];
        body[0..4].copy_from_slice(&multimedia_id.to_be_bytes());
        body[4] = 0; // image
        body[5] = 0; // JPEG
        body[7] = channel;
        body.extend_from_slice(payload);
        body
    }

    #[tokio::test]
    async fn test_in_order_reassembly() {
        let store = SnapshotStore::new();
        assert_eq!(
            store.ingest("123456789012", 3, 1, &first_packet(9, 1, b"AAA")).await,
            PacketOutcome::Ack(9)
        );
        assert_eq!(store.ingest("123456789012", 3, 2, b"BBB").await, PacketOutcome::Ack(9));
        assert_eq!(store.ingest("123456789012", 3, 3, b"CC").await, PacketOutcome::Ack(9));

        let done = store.take_complete("123456789012", 1).await.unwrap();
        assert_eq!(done.image, b"AAABBBCC");
        assert_eq!(done.chunks_received, 3);
    }

    #[tokio::test]
    async fn test_permuted_delivery_with_duplicate() {
        let store = SnapshotStore::new();
        // Packet 2 races ahead of packet 1 and is parked.
        assert_eq!(store.ingest("123456789012", 3, 2, b"B").await, PacketOutcome::Buffered);
        assert_eq!(
            store.ingest("123456789012", 3, 1, &first_packet(7, 1, b"A")).await,
            PacketOutcome::Ack(7)
        );
        assert_eq!(store.ingest("123456789012", 3, 3, b"C").await, PacketOutcome::Ack(7));
        // Duplicate of packet 2 is acknowledged but not double-counted.
        assert_eq!(store.ingest("123456789012", 3, 2, b"X").await, PacketOutcome::Ack(7));

        let done = store.take_complete("123456789012", 1).await.unwrap();
        assert_eq!(done.image, b"ABC");
        assert_eq!(done.chunks_received, 3);
    }

    #[tokio::test]
    async fn test_early_chunks_merge_only_matching_totals() {
        let store = SnapshotStore::new();
        // Leftover from a different upload with another packet count.
        assert_eq!(store.ingest("123456789012", 5, 2, b"zz").await, PacketOutcome::Buffered);
        assert_eq!(
            store.ingest("123456789012", 2, 1, &first_packet(3, 2, b"A")).await,
            PacketOutcome::Ack(3)
        );
        // The mismatched chunk was discarded, so the upload is incomplete.
        assert!(store.take_complete("123456789012", 2).await.is_none());
        assert_eq!(store.ingest("123456789012", 2, 2, b"B").await, PacketOutcome::Ack(3));
        let done = store.take_complete("123456789012", 2).await.unwrap();
        assert_eq!(done.image, b"AB");
    }

    #[tokio::test]
    async fn test_malformed_first_packet() {
        let store = SnapshotStore::new();
        assert_eq!(
            store.ingest("123456789012", 1, 1, &[0u8; 10]).await,
            PacketOutcome::MalformedFirst
        );
    }

    #[tokio::test]
    async fn test_preflight_cleanup_removes_incomplete() {
        let store = SnapshotStore::new();
        store.ingest("123456789012", 3, 1, &first_packet(5, 1, b"A")).await;
        store.preflight_cleanup("123456789012", 1).await;

        // New upload for the same (phone, channel) starts from scratch.
        store.ingest("123456789012", 1, 1, &first_packet(6, 1, b"Z")).await;
        let done = store.take_complete("123456789012", 1).await.unwrap();
        assert_eq!(done.image, b"Z");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_reports_partial_counts_on_timeout() {
        let store = SnapshotStore::new();
        store.ingest("123456789012", 3, 1, &first_packet(4, 1, b"A")).await;
        store.ingest("123456789012", 3, 2, b"B").await;

        match store.wait_for("123456789012", 1, Duration::from_secs(3)).await {
            SnapshotWait::TimedOut {
                chunks_received,
                expected_chunks,
            } => {
                assert_eq!(chunks_received, 2);
                assert_eq!(expected_chunks, 3);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_without_any_packet() {
        let store = SnapshotStore::new();
        match store.wait_for("123456789012", 1, Duration::from_secs(1)).await {
            SnapshotWait::NoData => {}
            other => panic!("expected no data, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_expires_idle_assemblies() {
        let store = SnapshotStore::new();
        store.ingest("123456789012", 3, 1, &first_packet(8, 1, b"A")).await;

        time::advance(Duration::from_secs(121)).await;
        store.sweep().await;

        assert!(store.partial_counts("123456789012", 1).await.is_none());
        // A late chunk after GC is parked, not resurrected.
        assert_eq!(store.ingest("123456789012", 3, 2, b"B").await, PacketOutcome::Buffered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_keeps_complete_assemblies() {
        let store = SnapshotStore::new();
        store.ingest("123456789012", 1, 1, &first_packet(2, 1, b"A")).await;
        time::advance(Duration::from_secs(300)).await;
        store.sweep().await;
        assert!(store.take_complete("123456789012", 1).await.is_some());
    }
}
