//! Configuration file for the LANBEAM CLI.

use lanbeam_core::config::MAX_MESSAGE_SIZE;
use lanbeam_core::{NodeConfig, SchedulerConfig};
use lanbeam_signal::{DEFAULT_PORT, SignalServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// LANBEAM configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling client settings
    #[serde(default)]
    pub signaling: SignalingConfig,
    /// Signaling server settings (`lanbeam serve`)
    #[serde(default)]
    pub server: ServerConfig,
    /// Data connection settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signaling client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling server URL
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Device label shown to peers; detected from the OS when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Seconds to wait before reconnecting
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
}

/// Signaling server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Data connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Address data listeners bind to
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Addresses advertised to peers; detected when empty
    #[serde(default)]
    pub advertise_ips: Vec<String>,
}

/// Transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum concurrent sends
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum peers sent to at once
    #[serde(default = "default_max_active_peers")]
    pub max_active_peers: usize,
    /// Directory received files are written to
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_server_url() -> String {
    format!("ws://127.0.0.1:{DEFAULT_PORT}/ws")
}

fn default_reconnect_secs() -> u64 {
    3
}

fn default_bind_addr() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_chunk_size() -> usize {
    lanbeam_files::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent() -> usize {
    SchedulerConfig::default().max_concurrent_transfers
}

fn default_max_active_peers() -> usize {
    SchedulerConfig::default().max_active_peers
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            device_name: None,
            reconnect_secs: default_reconnect_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            advertise_ips: Vec::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            max_active_peers: default_max_active_peers(),
            download_dir: default_download_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lanbeam/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = &self.signaling.server_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("Server URL must start with ws:// or wss://: {}", url);
        }

        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid server bind address: {}", self.server.bind_addr))?;
        self.parse_bind_ip()?;
        self.parse_advertise_ips()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size + 256 > MAX_MESSAGE_SIZE {
            anyhow::bail!("Chunk size must be between 1 byte and 16MB");
        }

        if self.transfer.max_concurrent == 0 || self.transfer.max_concurrent > 1000 {
            anyhow::bail!("Max concurrent transfers must be between 1 and 1000");
        }

        if self.transfer.max_active_peers == 0 {
            anyhow::bail!("Max active peers must be at least 1");
        }

        Ok(())
    }

    fn parse_bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.session
            .bind_ip
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid session bind IP: {}", self.session.bind_ip))
    }

    fn parse_advertise_ips(&self) -> anyhow::Result<Vec<IpAddr>> {
        self.session
            .advertise_ips
            .iter()
            .map(|ip| {
                ip.parse()
                    .map_err(|_| anyhow::anyhow!("Invalid advertised IP: {}", ip))
            })
            .collect()
    }

    /// Settings for a node
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut node = NodeConfig::default();

        node.signaling.server_url = self.signaling.server_url.clone();
        if let Some(name) = &self.signaling.device_name {
            node.signaling.device_label = name.clone();
        }
        node.signaling.reconnect_delay = Duration::from_secs(self.signaling.reconnect_secs);

        node.session.bind_ip = self.parse_bind_ip()?;
        node.session.advertise_ips = self.parse_advertise_ips()?;

        node.transfer.chunk_size = self.transfer.chunk_size;
        node.transfer.scheduler = SchedulerConfig {
            max_concurrent_transfers: self.transfer.max_concurrent,
            max_active_peers: self.transfer.max_active_peers,
        };
        node.transfer.download_dir = self.transfer.download_dir.clone();

        node.validate()?;
        Ok(node)
    }

    /// Settings for the signaling server
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address cannot be parsed.
    pub fn server_config(&self) -> anyhow::Result<SignalServerConfig> {
        Ok(SignalServerConfig {
            bind_addr: self.server.bind_addr.parse()?,
        })
    }
}
