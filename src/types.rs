use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::config::AppConfig;
use crate::registry::DeviceRegistry;
use crate::snapshot::SnapshotStore;

/// One connected terminal, keyed by its 12-digit BCD phone number.
#[derive(Debug, Clone)]
pub struct Device {
    pub phone_number: String,
    pub remote_addr: SocketAddr,
    pub last_seen: DateTime<Utc>,
    pub authenticated: bool,
    pub in_call: bool,
    pub auth_code: String,
    /// Non-owning handle to the connection's writer task. Cleared when the
    /// socket closes, re-set on the next message from the device.
    pub conn: Option<mpsc::Sender<Vec<u8>>>,
}

impl Device {
    pub fn new(phone_number: String, remote_addr: SocketAddr, conn: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            phone_number,
            remote_addr,
            last_seen: Utc::now(),
            authenticated: false,
            in_call: false,
            auth_code: String::new(),
            conn: Some(conn),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            phone_number: self.phone_number.clone(),
            remote_addr: self.remote_addr.to_string(),
            last_seen: self.last_seen,
            authenticated: self.authenticated,
            in_call: self.in_call,
            auth_code: self.auth_code.clone(),
        }
    }
}

/// Serializable projection of a device for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub phone_number: String,
    pub remote_addr: String,
    pub last_seen: DateTime<Utc>,
    pub authenticated: bool,
    pub in_call: bool,
    pub auth_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoipCall {
    pub call_id: String,
    pub device_phone: String,
    pub caller_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoSession {
    pub session_id: String,
    pub device_phone: String,
    pub channel: u8,
    pub stream_type: u8,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub media_server: String,
    pub media_port: u16,
}

/// In-memory bookkeeping for intercom calls and video sessions. Purely
/// informational: losing it costs nothing but listing accuracy.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    calls: HashMap<String, VoipCall>,
    videos: HashMap<String, VideoSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_call(&self, call: VoipCall) {
        self.inner.lock().await.calls.insert(call.call_id.clone(), call);
    }

    pub async fn insert_video(&self, session: VideoSession) {
        self.inner
            .lock()
            .await
            .videos
            .insert(session.session_id.clone(), session);
    }

    pub async fn call_for(&self, phone: &str) -> Option<VoipCall> {
        let inner = self.inner.lock().await;
        inner
            .calls
            .values()
            .find(|call| call.device_phone == phone)
            .cloned()
    }

    pub async fn end_call(&self, phone: &str) {
        let mut inner = self.inner.lock().await;
        for call in inner.calls.values_mut() {
            if call.device_phone == phone {
                call.status = "ended".to_string();
            }
        }
    }

    pub async fn stop_video(&self, phone: &str, channel: u8) {
        let mut inner = self.inner.lock().await;
        for session in inner.videos.values_mut() {
            if session.device_phone == phone && session.channel == channel {
                session.status = "stopped".to_string();
                info!("[VIDEO CONTROL] session {} marked as stopped", session.session_id);
            }
        }
    }

    /// Marks every session of the given devices as disconnected. Called from
    /// the proxy when a socket closes; never fails the teardown path.
    pub async fn mark_disconnected(&self, phones: &[String]) {
        if phones.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        for call in inner.calls.values_mut() {
            if phones.contains(&call.device_phone) && call.status == "initiated" {
                call.status = "disconnected".to_string();
            }
        }
        for session in inner.videos.values_mut() {
            if phones.contains(&session.device_phone) && session.status == "initiated" {
                session.status = "disconnected".to_string();
            }
        }
    }

    pub async fn list_calls(&self) -> Vec<VoipCall> {
        self.inner.lock().await.calls.values().cloned().collect()
    }

    pub async fn list_videos(&self) -> Vec<VideoSession> {
        self.inner.lock().await.videos.values().cloned().collect()
    }
}

/// The single composite context owned by the process entry point and shared
/// by the proxy, the dispatcher and the HTTP surface.
pub struct AppState {
    pub config: AppConfig,
    pub registry: DeviceRegistry,
    pub snapshots: SnapshotStore,
    pub sessions: SessionStore,
}

pub type SharedState = Arc<AppState>;
