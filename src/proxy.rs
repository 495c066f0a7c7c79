//! Device-facing TCP proxy: terminates each terminal connection, opens a
//! matching connection to the platform, relays bytes both ways and feeds a
//! frame splitter so the control plane can sniff the stream.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::dispatch;
use crate::protocol::jt808::FRAME_MARKER;
use crate::types::SharedState;

/// Splits a raw byte stream on 0x7E boundaries. Bytes before the first
/// marker are garbage and dropped; a partial frame is retained until the
/// closing marker arrives.
#[derive(Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns every complete marker-bracketed candidate,
    /// in stream order, regardless of how the input was chunked.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == FRAME_MARKER) else {
                self.buffer.clear();
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }
            let Some(end) = self.buffer[1..].iter().position(|&b| b == FRAME_MARKER) else {
                break;
            };
            let end = end + 1;
            frames.push(self.buffer[..=end].to_vec());
            self.buffer.drain(..=end);
        }
        frames
    }
}

pub async fn run_proxy(state: SharedState) -> Result<()> {
    let listener = TcpListener::bind(&state.config.listen_addr).await?;
    info!(
        "[JT808] listening on {}, proxying to {}",
        state.config.listen_addr, state.config.platform_addr
    );

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                info!("[JT808] new connection from {}", addr);
                let state = state.clone();
                tokio::spawn(async move {
                    handle_connection(state, socket, addr).await;
                });
            }
            Err(e) => {
                error!("[JT808] accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(state: SharedState, device: TcpStream, addr: SocketAddr) {
    let platform = match TcpStream::connect(&state.config.platform_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(
                "[JT808] failed to reach platform {} for {}: {}",
                state.config.platform_addr, addr, e
            );
            return;
        }
    };

    // Every write to the device socket funnels through this channel: the
    // platform relay and proxy-originated commands are serialized by one
    // writer task, so per-socket writes are never interleaved.
    let (device_tx, mut device_rx) = mpsc::channel::<Vec<u8>>(256);
    state.registry.register_connection(addr, device_tx.clone()).await;

    let (mut device_read, mut device_write) = device.into_split();
    let (mut platform_read, mut platform_write) = platform.into_split();

    let writer = tokio::spawn(async move {
        while let Some(data) = device_rx.recv().await {
            if device_write.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let uplink_state = state.clone();
    let uplink_tx = device_tx.clone();
    let mut uplink = tokio::spawn(async move {
        let mut splitter = FrameSplitter::new();
        let mut buf = vec![0u8; 2048];
        loop {
            let n = match device_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("[JT808] read error from device {}: {}", addr, e);
                    break;
                }
            };
            // Forward first: the relay must never stall on our decoding.
            if platform_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            for frame in splitter.push(&buf[..n]) {
                let state = uplink_state.clone();
                let writer = uplink_tx.clone();
                tokio::spawn(async move {
                    dispatch::handle_device_frame(&state, &frame, addr, &writer).await;
                });
            }
        }
    });

    let downlink_state = state.clone();
    let downlink_tx = device_tx.clone();
    let mut downlink = tokio::spawn(async move {
        let mut splitter = FrameSplitter::new();
        let mut buf = vec![0u8; 2048];
        loop {
            let n = match platform_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("[JT808] read error from platform for {}: {}", addr, e);
                    break;
                }
            };
            if downlink_tx.send(buf[..n].to_vec()).await.is_err() {
                break;
            }
            for frame in splitter.push(&buf[..n]) {
                let state = downlink_state.clone();
                tokio::spawn(async move {
                    dispatch::handle_platform_frame(&state, &frame).await;
                });
            }
        }
    });

    // EOF or error on either leg terminates both.
    tokio::select! {
        _ = &mut uplink => {}
        _ = &mut downlink => {}
    }
    uplink.abort();
    downlink.abort();
    writer.abort();

    // Keep the device record: a TCP reconnect re-attaches on the same phone.
    let affected = state.registry.deregister(addr, false).await;
    state.sessions.mark_disconnected(&affected).await;
    info!("[JT808] connection closed for {}", addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::jt808::build_frame;

    #[test]
    fn test_splitter_emits_frames_regardless_of_chunking() {
        let f1 = build_frame(0x0002, "123456789012", 1, &[]);
        let f2 = build_frame(0x0200, "123456789012", 2, &[0x7e, 0x7d, 0x01]);
        let f3 = build_frame(0x0102, "123456789012", 3, b"bsjgps");
        let mut stream = Vec::new();
        stream.extend_from_slice(&f1);
        stream.extend_from_slice(&f2);
        stream.extend_from_slice(&f3);

        // Byte-by-byte, and a few other chunk sizes.
        for chunk_size in [1, 2, 3, 7, stream.len()] {
            let mut splitter = FrameSplitter::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                got.extend(splitter.push(chunk));
            }
            assert_eq!(got, vec![f1.clone(), f2.clone(), f3.clone()], "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_splitter_drops_garbage_before_frame() {
        let frame = build_frame(0x0002, "123456789012", 1, &[]);
        let mut splitter = FrameSplitter::new();
        let mut input = vec![0x00, 0x11, 0x22];
        input.extend_from_slice(&frame);
        assert_eq!(splitter.push(&input), vec![frame]);
    }

    #[test]
    fn test_splitter_clears_markerless_garbage() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(&[0x01, 0x02, 0x03]).is_empty());
        // The garbage was not retained: a following frame still parses.
        let frame = build_frame(0x0002, "123456789012", 1, &[]);
        assert_eq!(splitter.push(&frame), vec![frame]);
    }

    #[test]
    fn test_splitter_retains_partial_frame() {
        let frame = build_frame(0x0102, "123456789012", 3, b"bsjgps");
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(&frame[..5]).is_empty());
        assert_eq!(splitter.push(&frame[5..]), vec![frame]);
    }
}
