use bytes::Bytes;
use tokio::sync::broadcast;

/// Fully assembled media handed to downstream subscribers.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    Video {
        channel: u8,
        /// 0 = I, 1 = P, 2 = B.
        frame_type: u8,
        sequence: u16,
        data: Bytes,
    },
    Audio {
        channel: u8,
        /// Raw G.711 A-law bytes, one sample per byte.
        data: Bytes,
        duration: f32,
    },
}

/// Fan-out hub for assembled frames. Publishing never blocks: the broadcast
/// ring is bounded and slow subscribers skip ahead, dropping the oldest
/// events they missed.
#[derive(Clone)]
pub struct MediaHub {
    tx: broadcast::Sender<MediaEvent>,
}

impl MediaHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.tx.subscribe()
    }

    pub fn publish_video(&self, channel: u8, frame_type: u8, sequence: u16, data: Vec<u8>) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(MediaEvent::Video {
            channel,
            frame_type,
            sequence,
            data: Bytes::from(data),
        });
    }

    pub fn publish_audio(&self, channel: u8, data: Vec<u8>, duration: f32) {
        let _ = self.tx.send(MediaEvent::Audio {
            channel,
            data: Bytes::from(data),
            duration,
        });
    }
}
