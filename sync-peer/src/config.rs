//! Configuration loading for a peersync node.
//!
//! Configuration is loaded from a TOML file (default: `peersync.toml`).
//! Every field has a default, so an empty file describes a working node
//! sharing `./share` on port 8111 with no initial peers.

use crate::protocol::fits_frame;
use peersync_types::PeerAddress;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Identity and connection limits.
    #[serde(default)]
    pub node: NodeConfig,
    /// Shared directory and synchronization cadence.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Network timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Node identity and connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name advertised to peers in handshakes (default: localhost).
    #[serde(default = "default_advertised_name")]
    pub advertised_name: String,
    /// Interface to listen on (default: 0.0.0.0).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Listening port; 0 picks a free port (default: 8111).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of live connections before new inbound peers are
    /// refused (default: 10).
    #[serde(default = "default_max_incoming_connections")]
    pub max_incoming_connections: usize,
    /// Commands buffered per connection before senders wait (default: 256).
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// Peers to dial at startup, as `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Synchronization configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory to share (default: share).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Seconds between synchronization cycles (default: 60).
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Seconds to wait before pushing local state to a newly admitted peer
    /// (default: 3).
    #[serde(default = "default_initial_sync_delay_secs")]
    pub initial_sync_delay_secs: u64,
    /// Bytes per file chunk (default: 1 MiB).
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

/// Timeout configuration, all in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP connect (default: 5).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Waiting for the other side's handshake frame (default: 10).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Send a heartbeat after this long without sending (default: 15).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Drop a connection after this long without receiving (default: 60).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

// Default value functions
fn default_advertised_name() -> String {
    "localhost".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8111
}

fn default_max_incoming_connections() -> usize {
    10
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_root() -> PathBuf {
    PathBuf::from("share")
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_initial_sync_delay_secs() -> u64 {
    3
}

fn default_block_size() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            advertised_name: default_advertised_name(),
            bind_host: default_bind_host(),
            port: default_port(),
            max_incoming_connections: default_max_incoming_connections(),
            outbox_capacity: default_outbox_capacity(),
            peers: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            sync_interval_secs: default_sync_interval_secs(),
            initial_sync_delay_secs: default_initial_sync_delay_secs(),
            block_size: default_block_size(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl TimeoutConfig {
    /// TCP connect timeout.
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Handshake frame timeout.
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Send inactivity before a heartbeat.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Receive inactivity before the connection is dropped.
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML, for writing a starter file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });

        if self.sync.block_size == 0 {
            return invalid("sync.block_size must be greater than zero".into());
        }
        if !fits_frame(self.sync.block_size) {
            return invalid(format!(
                "sync.block_size {} does not fit in one frame once encoded",
                self.sync.block_size
            ));
        }
        if self.node.outbox_capacity == 0 {
            return invalid("node.outbox_capacity must be greater than zero".into());
        }
        if self.sync.sync_interval_secs == 0 {
            return invalid("sync.sync_interval_secs must be greater than zero".into());
        }
        if self.timeouts.heartbeat_interval_secs == 0 {
            return invalid("timeouts.heartbeat_interval_secs must be greater than zero".into());
        }
        if self.timeouts.idle_timeout_secs <= self.timeouts.heartbeat_interval_secs {
            return invalid(format!(
                "timeouts.idle_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.timeouts.idle_timeout_secs, self.timeouts.heartbeat_interval_secs
            ));
        }
        self.peer_addresses().map(|_| ())
    }

    /// Configured peers, parsed.
    pub fn peer_addresses(&self) -> Result<Vec<PeerAddress>, ConfigError> {
        self.node
            .peers
            .iter()
            .map(|peer| {
                peer.parse().map_err(|e| ConfigError::Invalid {
                    reason: format!("node.peers: {e}"),
                })
            })
            .collect()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to render configuration.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),
    /// A value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.node.port, 8111);
        assert_eq!(config.node.max_incoming_connections, 10);
        assert_eq!(config.sync.initial_sync_delay_secs, 3);
        assert_eq!(config.sync.block_size, 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[node]
advertised_name = "alpha.local"
port = 9000
max_incoming_connections = 2
peers = ["beta.local:9001", "10.0.0.3:9002"]

[sync]
root = "/srv/share"
sync_interval_secs = 30
block_size = 4096

[timeouts]
idle_timeout_secs = 90
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.node.advertised_name, "alpha.local");
        assert_eq!(config.node.port, 9000);
        assert_eq!(config.node.max_incoming_connections, 2);
        assert_eq!(config.sync.root, PathBuf::from("/srv/share"));
        assert_eq!(config.sync.block_size, 4096);
        assert_eq!(config.timeouts.idle_timeout_secs, 90);
        assert_eq!(config.timeouts.heartbeat_interval_secs, 15);
        assert_eq!(
            config.peer_addresses().unwrap(),
            vec![
                PeerAddress::new("beta.local", 9001),
                PeerAddress::new("10.0.0.3", 9002)
            ]
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn rendered_config_parses_back() {
        let mut config = Config::default();
        config.node.peers.push("peer:1".into());
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn zero_block_size_rejected() {
        let mut config = Config::default();
        config.sync.block_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn oversized_block_rejected() {
        let mut config = Config::default();
        config.sync.block_size = 64 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn idle_must_exceed_heartbeat() {
        let mut config = Config::default();
        config.timeouts.idle_timeout_secs = config.timeouts.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_peer_rejected() {
        let mut config = Config::default();
        config.node.peers = vec!["no-port".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("node.peers"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_file(Path::new("/nonexistent/peersync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
        assert!(err.to_string().contains("/nonexistent/peersync.toml"));
    }
}
