//! Regrouping of fragmented JT1078 video packets into complete H.264 access
//! units, with a per-channel SPS/PPS cache for decoder bootstrap.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::fanout::MediaHub;
use crate::protocol::jt1078::{
    MediaFrame, DATA_TYPE_IFRAME, SUB_PACKAGE_ATOMIC, SUB_PACKAGE_FIRST, SUB_PACKAGE_LAST,
    SUB_PACKAGE_MIDDLE,
};

/// Annex-B access unit delimiter prepended to every emitted frame.
const AUD: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0x10];

const GROUP_IDLE_LIMIT: Duration = Duration::from_secs(3);
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

struct Fragment {
    sub_type: u8,
    sequence: u16,
    data: Vec<u8>,
}

/// Fragments sharing one (channel, device timestamp) key.
struct FrameGroup {
    frame_type: u8,
    sequence: u16,
    fragments: Vec<Fragment>,
    last_update: Instant,
}

#[derive(Default, Clone)]
struct ParamSets {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

pub struct VideoAssembler {
    hub: MediaHub,
    groups: Mutex<HashMap<(u8, u64), FrameGroup>>,
    param_sets: Mutex<HashMap<u8, ParamSets>>,
}

impl VideoAssembler {
    pub fn new(hub: MediaHub) -> Self {
        Self {
            hub,
            groups: Mutex::new(HashMap::new()),
            param_sets: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds one video packet. Atomic packets are emitted immediately;
    /// fragments collect under their (channel, timestamp) key and flush once
    /// both the first and the last fragment have arrived.
    pub async fn handle_frame(&self, frame: MediaFrame) {
        if frame.payload.is_empty() {
            return;
        }

        if frame.data_type == DATA_TYPE_IFRAME {
            self.cache_parameter_sets(frame.channel, &frame.payload).await;
        }

        if frame.sub_type == SUB_PACKAGE_ATOMIC {
            self.emit(frame.channel, frame.data_type, frame.sequence, frame.payload)
                .await;
            return;
        }

        let completed = {
            let mut groups = self.groups.lock().await;
            let key = (frame.channel, frame.timestamp);
            let group = groups.entry(key).or_insert_with(|| FrameGroup {
                frame_type: frame.data_type,
                sequence: frame.sequence,
                fragments: Vec::new(),
                last_update: Instant::now(),
            });
            group.fragments.push(Fragment {
                sub_type: frame.sub_type,
                sequence: frame.sequence,
                data: frame.payload,
            });
            group.last_update = Instant::now();

            let has_first = group.fragments.iter().any(|f| f.sub_type == SUB_PACKAGE_FIRST);
            let has_last = group.fragments.iter().any(|f| f.sub_type == SUB_PACKAGE_LAST);
            if has_first && has_last {
                groups.remove(&key)
            } else {
                None
            }
        };

        if let Some(group) = completed {
            let payload = reconstruct(group.fragments);
            debug!(
                "[VIDEO] assembled frame: channel {}, type {}, {} bytes",
                frame.channel,
                group.frame_type,
                payload.len()
            );
            self.emit(frame.channel, group.frame_type, group.sequence, payload)
                .await;
        }
    }

    /// Emits one access unit: the AUD, then (for I-frames missing inline
    /// parameter sets) the cached SPS/PPS of the channel, then the payload.
    /// No lock is held across the publish.
    async fn emit(&self, channel: u8, frame_type: u8, sequence: u16, payload: Vec<u8>) {
        let mut prefix = AUD.to_vec();

        if frame_type == DATA_TYPE_IFRAME {
            let (has_sps, has_pps) = contains_parameter_sets(&payload);
            if !has_sps || !has_pps {
                let cached = self.param_sets.lock().await.get(&channel).cloned();
                if let Some(ParamSets {
                    sps: Some(sps),
                    pps: Some(pps),
                }) = cached
                {
                    prefix.extend_from_slice(&sps);
                    prefix.extend_from_slice(&pps);
                }
            }
        }

        prefix.extend_from_slice(&payload);
        self.hub.publish_video(channel, frame_type, sequence, prefix);
    }

    /// Scans an I-frame payload for SPS/PPS NAL units and caches start-coded
    /// copies for the channel.
    async fn cache_parameter_sets(&self, channel: u8, payload: &[u8]) {
        let (sps, pps) = scan_parameter_sets(payload);
        if sps.is_none() && pps.is_none() {
            return;
        }
        let mut cache = self.param_sets.lock().await;
        let entry = cache.entry(channel).or_default();
        if let Some(sps) = sps {
            debug!("[VIDEO] cached SPS for channel {} ({} bytes)", channel, sps.len());
            entry.sps = Some(sps);
        }
        if let Some(pps) = pps {
            debug!("[VIDEO] cached PPS for channel {} ({} bytes)", channel, pps.len());
            entry.pps = Some(pps);
        }
    }

    /// Drops fragment groups idle for over three seconds.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut groups = self.groups.lock().await;
        groups.retain(|(channel, _), group| {
            let expired = now.duration_since(group.last_update) > GROUP_IDLE_LIMIT;
            if expired {
                info!(
                    "[VIDEO] discarded incomplete frame: channel {}, {} fragments",
                    channel,
                    group.fragments.len()
                );
            }
            !expired
        });
    }

    pub async fn run_cleanup(&self) {
        let mut ticker = time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

/// Concatenates fragments in logical order: first, middles by sequence,
/// last. Ties inside a class break by sequence number, so reconstruction is
/// deterministic regardless of arrival order.
fn reconstruct(mut fragments: Vec<Fragment>) -> Vec<u8> {
    if fragments.len() == 1 {
        return fragments.remove(0).data;
    }
    fragments.sort_by_key(|f| (logical_order(f.sub_type), f.sequence));
    let total = fragments.iter().map(|f| f.data.len()).sum();
    let mut out = Vec::with_capacity(total);
    for fragment in fragments {
        out.extend_from_slice(&fragment.data);
    }
    out
}

fn logical_order(sub_type: u8) -> u8 {
    match sub_type {
        SUB_PACKAGE_FIRST => 0,
        SUB_PACKAGE_MIDDLE => 1,
        SUB_PACKAGE_LAST => 2,
        _ => 0,
    }
}

/// Quick presence check for SPS/PPS near the head of a payload.
fn contains_parameter_sets(payload: &[u8]) -> (bool, bool) {
    let mut has_sps = false;
    let mut has_pps = false;
    let limit = payload.len().saturating_sub(5).min(100);
    for i in 0..limit {
        if let Some((nal_start, _)) = start_code_at(payload, i) {
            match payload[nal_start] & 0x1f {
                7 => has_sps = true,
                8 => has_pps = true,
                _ => {}
            }
        }
    }
    (has_sps, has_pps)
}

/// Extracts the latest SPS and PPS NAL units from a payload, re-prefixed
/// with 4-byte start codes.
fn scan_parameter_sets(payload: &[u8]) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut sps = None;
    let mut pps = None;
    if payload.len() < 5 {
        return (sps, pps);
    }

    let mut i = 0;
    while i < payload.len() - 4 {
        let Some((nal_start, _)) = start_code_at(payload, i) else {
            i += 1;
            continue;
        };
        if nal_start >= payload.len() {
            break;
        }
        let nal_type = payload[nal_start] & 0x1f;
        if nal_type == 7 || nal_type == 8 {
            let mut nal_end = payload.len();
            let mut j = nal_start + 1;
            while j < payload.len().saturating_sub(4) {
                if start_code_at(payload, j).is_some() {
                    nal_end = j;
                    break;
                }
                j += 1;
            }
            let mut nal = vec![0x00, 0x00, 0x00, 0x01];
            nal.extend_from_slice(&payload[nal_start..nal_end]);
            if nal_type == 7 {
                sps = Some(nal);
            } else {
                pps = Some(nal);
            }
            i = nal_end;
        } else {
            i += 1;
        }
    }
    (sps, pps)
}

/// Returns (first NAL byte index, start code length) when a 3- or 4-byte
/// Annex-B start code begins at `i`.
fn start_code_at(payload: &[u8], i: usize) -> Option<(usize, usize)> {
    if i + 3 < payload.len() && payload[i] == 0 && payload[i + 1] == 0 {
        if payload[i + 2] == 1 {
            return Some((i + 3, 3));
        }
        if payload[i + 2] == 0 && payload[i + 3] == 1 && i + 4 < payload.len() {
            return Some((i + 4, 4));
        }
    }
    None
}
