//! Node configuration

use peerlink_discovery::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display name announced to other peers
    pub username: String,

    /// Where received files land
    pub download_dir: String,

    pub network: NetworkConfig,

    pub discovery: DiscoveryConfig,

    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the service and discovery listeners bind to
    pub bind_host: String,
    /// First service port tried
    pub base_port: u16,
    /// Consecutive service ports tried before the fallback
    pub port_range: u16,
    /// Service port used when the whole range is taken
    pub fallback_port: u16,
    /// Discovery listener offset from the service port
    pub discovery_offset: u16,
    /// Linear retries when the discovery port is taken
    pub discovery_bind_attempts: u16,
    /// Inbound read timeout in seconds
    pub read_timeout_secs: u64,
    /// Outbound session timeout in seconds
    pub send_timeout_secs: u64,
    /// Client-side limit on a user-facing action in seconds
    pub action_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// File body chunk size in bytes
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: "peer".to_string(),
            download_dir: "~/Downloads/P2P_Files".to_string(),
            network: NetworkConfig::default(),
            discovery: DiscoveryConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            base_port: peerlink_core::DEFAULT_BASE_PORT,
            port_range: peerlink_core::DEFAULT_PORT_RANGE,
            fallback_port: peerlink_core::DEFAULT_BASE_PORT,
            discovery_offset: peerlink_core::DISCOVERY_PORT_OFFSET,
            discovery_bind_attempts: 10,
            read_timeout_secs: 30,
            send_timeout_secs: 5,
            action_timeout_secs: 10,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: peerlink_core::CHUNK_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise defaults; then apply
    /// environment overrides
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `PEERLINK_USERNAME` and `PEERLINK_PORT`
    pub fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("PEERLINK_USERNAME") {
            if !name.trim().is_empty() {
                self.username = name.trim().to_string();
            }
        }
        if let Ok(s) = std::env::var("PEERLINK_PORT") {
            match s.parse::<u16>() {
                Ok(port) => self.network.base_port = port,
                Err(_) => tracing::warn!("Ignoring invalid PEERLINK_PORT={}", s),
            }
        }
    }

    /// Expand ~ in download_dir path
    pub fn download_dir(&self) -> PathBuf {
        expand_path(&self.download_dir)
    }

    pub fn bind_host(&self) -> peerlink_core::Result<IpAddr> {
        self.network.bind_host.parse().map_err(|e| {
            peerlink_core::Error::InvalidInput(format!(
                "bind_host {:?}: {}",
                self.network.bind_host, e
            ))
        })
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default config file location: ~/.peerlink/config.toml
pub fn default_config_path() -> PathBuf {
    expand_path("~/.peerlink/config.toml")
}
