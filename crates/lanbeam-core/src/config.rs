//! Node configuration

use crate::device;
use crate::error::{NodeError, Result};
use lanbeam_files::{DEFAULT_CHUNK_SIZE, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER};
use lanbeam_signal::{DEFAULT_PORT, SignalClientConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Largest message accepted on a data channel (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Signaling configuration
    pub signaling: SignalingConfig,

    /// Session negotiation configuration
    pub session: SessionConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

impl NodeConfig {
    /// Check invariants between settings
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.chunk_size == 0 {
            return Err(NodeError::invalid_config("chunk_size must be greater than 0"));
        }
        // Room for the data frame header: length byte plus a 255-byte id
        if t.chunk_size + 256 > self.session.max_message_size {
            return Err(NodeError::invalid_config(
                "chunk_size does not fit in a data channel message",
            ));
        }
        if t.low_water > t.high_water {
            return Err(NodeError::invalid_config(
                "low_water must not exceed high_water",
            ));
        }
        if t.scheduler.max_concurrent_transfers == 0 {
            return Err(NodeError::invalid_config(
                "max_concurrent_transfers must be at least 1",
            ));
        }
        if t.scheduler.max_active_peers == 0 {
            return Err(NodeError::invalid_config(
                "max_active_peers must be at least 1",
            ));
        }
        if self.signaling.server_url.is_empty() {
            return Err(NodeError::invalid_config("server_url must be set"));
        }
        Ok(())
    }

    /// Settings for the signaling client
    pub fn signal_client_config(&self) -> SignalClientConfig {
        SignalClientConfig {
            server_url: self.signaling.server_url.clone(),
            device_label: self.signaling.device_label.clone(),
            reconnect_delay: self.signaling.reconnect_delay,
        }
    }
}

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Signaling server URL
    pub server_url: String,

    /// Label announced to other peers
    pub device_label: String,

    /// Delay before reconnecting after an abnormal close
    pub reconnect_delay: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{DEFAULT_PORT}/ws"),
            device_label: device::device_label().to_string(),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

/// Session negotiation configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local address data channel listeners bind to
    pub bind_ip: IpAddr,

    /// Addresses advertised as candidates; empty means detect
    pub advertise_ips: Vec<IpAddr>,

    /// Time a freshly accepted data connection has to identify its session
    pub hello_timeout: Duration,

    /// Time allowed for dialing one candidate
    pub connect_timeout: Duration,

    /// Largest message accepted on a data channel
    pub max_message_size: usize,

    /// Time shutdown waits for queued channel data to be delivered
    pub flush_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ips: Vec::new(),
            hello_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_message_size: MAX_MESSAGE_SIZE,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Loopback-only settings, used by tests and same-host demos
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }
}

/// Transfer scheduler limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Global cap on concurrently running sends
    pub max_concurrent_transfers: usize,

    /// Cap on distinct peers with running sends
    pub max_active_peers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 9,
            max_active_peers: 3,
        }
    }
}

/// Transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per data frame
    pub chunk_size: usize,

    /// Buffered bytes above which a sender pauses
    pub high_water: u64,

    /// Buffered bytes at which a paused sender resumes
    pub low_water: u64,

    /// Scheduler limits
    pub scheduler: SchedulerConfig,

    /// Directory received files are written to
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            scheduler: SchedulerConfig::default(),
            download_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transfer.chunk_size, 128 * 1024);
        assert_eq!(config.transfer.scheduler.max_concurrent_transfers, 9);
        assert_eq!(config.transfer.scheduler.max_active_peers, 3);
        assert_eq!(config.signaling.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transfer.chunk_size = MAX_MESSAGE_SIZE;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transfer.low_water = config.transfer.high_water + 1;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transfer.scheduler.max_active_peers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_signal_client_config() {
        let mut config = NodeConfig::default();
        config.signaling.server_url = "ws://10.1.1.1:4927/ws".into();
        config.signaling.device_label = "Mac".into();
        let client = config.signal_client_config();
        assert_eq!(client.server_url, "ws://10.1.1.1:4927/ws");
        assert_eq!(client.device_label, "Mac");
    }
}
