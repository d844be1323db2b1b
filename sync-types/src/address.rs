//! Identity types for peers and their connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The address a peer is known by: the host and port it advertises.
///
/// Value type with equality on `(host, port)`. On the wire it is the
/// `{"host": .., "port": ..}` object; in configuration files it is written
/// as `host:port`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Create a new PeerAddress.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The advertised host name or IP literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The advertised port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({}:{})", self.host, self.port)
    }
}

/// Error returned when a `host:port` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer address {input:?}: {reason}")]
pub struct AddressParseError {
    /// The rejected input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| AddressParseError {
            input: s.to_string(),
            reason,
        };

        let (host, port) = s.trim().rsplit_once(':').ok_or_else(|| fail("missing port"))?;
        if host.is_empty() {
            return Err(fail("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| fail("port is not a number"))?;
        Ok(Self::new(host, port))
    }
}

/// Identifies one physical connection.
///
/// A peer that reconnects gets a fresh id, so bookkeeping for a closed
/// connection can never touch its successor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Create a new random ConnectionId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", &self.to_string()[..8])
    }
}
