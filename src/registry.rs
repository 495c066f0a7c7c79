use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::types::{Device, DeviceInfo};

/// In-memory table of connected terminals: `phone -> Device` plus a reverse
/// `remote addr -> writer` index, both behind one coarse mutex so a socket
/// close cleans both maps atomically. Critical sections stay short and never
/// perform I/O; senders are cloned out before any write.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, Device>,
    connections: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly accepted connection before any frame arrives.
    pub async fn register_connection(&self, addr: SocketAddr, writer: mpsc::Sender<Vec<u8>>) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(addr, writer);
    }

    /// Creates or refreshes a device record from a sniffed frame. Every
    /// message re-points the record at the current socket, which is what
    /// makes a reconnect on a new socket supersede the old one.
    pub async fn upsert(&self, phone: &str, addr: SocketAddr, writer: &mpsc::Sender<Vec<u8>>) {
        if phone.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(phone) {
            device.conn = Some(writer.clone());
            device.remote_addr = addr;
            device.last_seen = Utc::now();
        } else {
            info!("[JT808] new device {} from {}", phone, addr);
            inner
                .devices
                .insert(phone.to_string(), Device::new(phone.to_string(), addr, writer.clone()));
        }
    }

    pub async fn get(&self, phone: &str) -> Option<Device> {
        self.inner.lock().await.devices.get(phone).cloned()
    }

    pub async fn list(&self) -> Vec<DeviceInfo> {
        let inner = self.inner.lock().await;
        inner.devices.values().map(Device::info).collect()
    }

    pub async fn set_auth_code(&self, phone: &str, code: String) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(phone) {
            device.auth_code = code;
        }
    }

    /// Marks a device authenticated after a platform 0x8001 with result 0.
    pub async fn set_authenticated(&self, phone: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(phone) {
            Some(device) => {
                device.authenticated = true;
                true
            }
            None => false,
        }
    }

    pub async fn set_in_call(&self, phone: &str, in_call: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(phone) {
            device.in_call = in_call;
        }
    }

    /// Tears down everything associated with a closed socket. With
    /// `deregister_device` false (the normal case) the device record
    /// survives with a cleared handle so a TCP reconnect re-attaches under
    /// the same phone. Returns the phones whose live connection this was so
    /// the caller can mark their media sessions disconnected.
    pub async fn deregister(&self, addr: SocketAddr, deregister_device: bool) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&addr);

        let mut affected = Vec::new();
        for (phone, device) in inner.devices.iter_mut() {
            if device.remote_addr == addr {
                device.conn = None;
                device.in_call = false;
                affected.push(phone.clone());
            }
        }
        if deregister_device {
            for phone in &affected {
                inner.devices.remove(phone);
                debug!("[JT808] deregistered device {} after close of {}", phone, addr);
            }
        }
        affected
    }

    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.devices.len(), inner.connections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn writer() -> mpsc::Sender<Vec<u8>> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let registry = DeviceRegistry::new();
        let tx = writer();
        registry.register_connection(addr(9001), tx.clone()).await;
        registry.upsert("123456789012", addr(9001), &tx).await;

        let device = registry.get("123456789012").await.unwrap();
        assert_eq!(device.remote_addr, addr(9001));
        assert!(device.conn.is_some());
        assert!(!device.authenticated);
    }

    #[tokio::test]
    async fn test_deregister_keeps_device_by_default() {
        let registry = DeviceRegistry::new();
        let tx = writer();
        registry.upsert("123456789012", addr(9001), &tx).await;

        let affected = registry.deregister(addr(9001), false).await;
        assert_eq!(affected, vec!["123456789012".to_string()]);

        let device = registry.get("123456789012").await.unwrap();
        assert!(device.conn.is_none());
    }

    #[tokio::test]
    async fn test_deregister_can_evict_device() {
        let registry = DeviceRegistry::new();
        let tx = writer();
        registry.upsert("123456789012", addr(9001), &tx).await;
        registry.deregister(addr(9001), true).await;
        assert!(registry.get("123456789012").await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_socket() {
        let registry = DeviceRegistry::new();
        let old = writer();
        let new = writer();
        registry.upsert("123456789012", addr(9001), &old).await;
        registry.upsert("123456789012", addr(9002), &new).await;

        // Closing the stale socket must not detach the device.
        let affected = registry.deregister(addr(9001), false).await;
        assert!(affected.is_empty());

        let device = registry.get("123456789012").await.unwrap();
        assert_eq!(device.remote_addr, addr(9002));
        assert!(device.conn.is_some());
    }

    #[tokio::test]
    async fn test_authentication_flag() {
        let registry = DeviceRegistry::new();
        let tx = writer();
        registry.upsert("123456789012", addr(9001), &tx).await;
        assert!(registry.set_authenticated("123456789012").await);
        assert!(!registry.set_authenticated("000000000000").await);
        assert!(registry.get("123456789012").await.unwrap().authenticated);
    }
}
