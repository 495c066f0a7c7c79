use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Process configuration. Loaded from a JSON file (written with defaults on
/// first run), then overridden by environment variables so deployments can
/// keep a static file and inject the platform address at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Device-facing listener for the JT808 proxy.
    pub listen_addr: String,
    /// Upstream telematics platform the proxy dials for every device.
    pub platform_addr: String,
    /// Control surface HTTP port.
    pub http_port: u16,
    /// Listener for JT1078 media streams opened by devices after 0x9101.
    pub media_port: u16,
    /// Address handed to devices inside 0x9101 bodies.
    pub media_server_ip: String,
    pub media_server_port: u16,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1024".to_string(),
            platform_addr: String::new(),
            http_port: 8080,
            media_port: 7800,
            media_server_ip: "127.0.0.1".to_string(),
            media_server_port: 7800,
            verbose: false,
        }
    }
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            let config = Self::default();
            config.save(path)?;
            config
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(addr) = env::var("PLATFORM_HOST") {
            self.platform_addr = addr;
        }
        if let Ok(ip) = env::var("MEDIA_SERVER_IP") {
            self.media_server_ip = ip;
        }
        if let Ok(port) = env::var("MEDIA_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.media_server_port = port;
            }
        }
        if env::var("VERBOSE").is_ok() {
            self.verbose = true;
        }
    }

    pub fn http_bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.http_port)
    }

    pub fn media_bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.media_port)
    }
}
