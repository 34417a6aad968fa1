//! Configuration management
//!
//! Process-level settings read from the environment. Runtime settings that
//! clients change over HTTP live in [`crate::settings`].

use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server port
    pub server_port: u16,
    /// Main folder: settings, images, snapshot store and exported snapshots
    pub folder: PathBuf,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Maximum pending uploads in queue
    pub upload_queue_size: usize,
    /// Seconds to wait before each retry of a failed upload
    pub upload_retry_delays: Vec<u64>,
    /// Timeout of a single request to DeviceHub, in seconds
    pub devicehub_timeout_secs: u64,
    /// IP reported by `/info`; detected when unset
    pub advertised_ip: Option<String>,
    /// INI file edited through the dashboard
    pub config_ini: PathBuf,
}

/// Outbound IPv4 address of this host.
///
/// Connecting a UDP socket sends no packets; it only makes the kernel pick
/// the interface it would route through.
fn detect_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Parse a comma separated list of seconds, e.g. `1,2,4`.
fn parse_delays(raw: &str) -> Option<Vec<u64>> {
    raw.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect()
}

fn default_folder() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("workbench")
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok(); // Load .env if present

        let folder = env::var("WORKBENCH_FOLDER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_folder());

        let mut config = Self::with_folder(folder);

        config.server_port = env::var("SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.server_port);

        config.request_timeout_secs = env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.request_timeout_secs);

        config.upload_queue_size = env::var("UPLOAD_QUEUE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.upload_queue_size);

        if let Some(delays) = env::var("UPLOAD_RETRY_DELAYS")
            .ok()
            .and_then(|v| parse_delays(&v))
        {
            config.upload_retry_delays = delays;
        }

        config.devicehub_timeout_secs = env::var("DEVICEHUB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.devicehub_timeout_secs);

        config.advertised_ip = env::var("ADVERTISED_IP").ok().or(config.advertised_ip);

        if let Ok(path) = env::var("CONFIG_INI") {
            config.config_ini = PathBuf::from(path);
        }

        config
    }

    /// Defaults rooted at `folder`.
    pub fn with_folder(folder: PathBuf) -> Self {
        Self {
            server_port: 8091,
            config_ini: folder.join("config.ini"),
            folder,
            request_timeout_secs: 30,
            upload_queue_size: 256,
            upload_retry_delays: vec![1, 2, 4],
            devicehub_timeout_secs: 10,
            advertised_ip: None,
        }
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.folder.join(".settings")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.folder.join("images")
    }

    /// Where the snapshot store keeps one document per snapshot.
    pub fn store_dir(&self) -> PathBuf {
        self.folder.join(".snapshots")
    }

    /// Where uploaded snapshots are exported as timestamped files.
    pub fn export_dir(&self) -> PathBuf {
        self.folder.join("Snapshots")
    }

    pub fn ip(&self) -> String {
        self.advertised_ip.clone().unwrap_or_else(detect_ip)
    }

    /// Create every folder the server writes into.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.settings_dir(),
            self.images_dir(),
            self.store_dir(),
            self.export_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        if let Some(parent) = self.config_ini.parent().filter(|p| *p != Path::new("")) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}
