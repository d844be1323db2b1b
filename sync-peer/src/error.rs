//! Error types for peersync-peer.

use peersync_types::{PeerAddress, WireError};
use std::path::PathBuf;

/// Main error type for node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Event source error.
    #[error("event source error: {0}")]
    Events(#[from] EventSourceError),

    /// Outbound connection error.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// The listening socket could not be opened.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address we tried to listen on.
        address: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage capability errors.
///
/// The display form doubles as the refusal reason sent to the peer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The path already holds this exact content.
    #[error("pathname already exists: {path}")]
    AlreadyExists {
        /// The path.
        path: String,
    },

    /// Nothing at the path.
    #[error("pathname does not exist: {path}")]
    NotFound {
        /// The path.
        path: String,
    },

    /// The local copy is at least as recent as the incoming one.
    #[error("local copy of {path} is newer")]
    Stale {
        /// The path.
        path: String,
    },

    /// Another transfer holds the path.
    #[error("transfer already in progress for {path}")]
    TransferInProgress {
        /// The path.
        path: String,
    },

    /// The path escapes or is not usable inside the share.
    #[error("unsafe pathname {path:?}: {reason}")]
    InvalidPath {
        /// The path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Bytes arrived for a path with no pending transfer.
    #[error("no transfer reserved for {path}")]
    NotReserved {
        /// The path.
        path: String,
    },

    /// Assembled file has the wrong length.
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The path.
        path: String,
        /// Length from the descriptor.
        expected: u64,
        /// Length assembled.
        actual: u64,
    },

    /// Assembled or local content does not match the descriptor.
    #[error("content of {path} does not match its descriptor")]
    IdentityMismatch {
        /// The path.
        path: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol layer errors on one connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame did not decode into a command.
    #[error("{0}")]
    Wire(#[from] WireError),

    /// Framing or socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The other side closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// Waited too long for a frame.
    #[error("timed out waiting for {what}")]
    Timeout {
        /// What we were waiting for.
        what: &'static str,
    },

    /// A valid command arrived where another was required.
    #[error("unexpected command: expected {expected}, got {actual}")]
    UnexpectedCommand {
        /// Expected command kind.
        expected: &'static str,
        /// Actual command kind received.
        actual: &'static str,
    },
}

impl ProtocolError {
    /// Whether the connection must be closed.
    ///
    /// Only a well-formed frame of an unknown kind can be skipped.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::Wire(e) => e.is_fatal(),
            _ => true,
        }
    }
}

/// Outbound connection failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Every candidate in the refusal chain failed.
    #[error("no peer accepted the connection after {attempted} attempts")]
    Exhausted {
        /// Number of addresses dialed.
        attempted: usize,
    },

    /// A connection to the address was registered while we were dialing.
    #[error("already connected to {address}")]
    AlreadyConnected {
        /// The address.
        address: PeerAddress,
    },
}

/// Event source errors.
#[derive(Debug, thiserror::Error)]
pub enum EventSourceError {
    /// The watched directory could not be read.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// Directory being scanned.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The background scan task died.
    #[error("scan task failed: {0}")]
    Task(String),
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Result type alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_read_as_refusal_reasons() {
        let err = StoreError::AlreadyExists {
            path: "docs/a.txt".into(),
        };
        assert_eq!(err.to_string(), "pathname already exists: docs/a.txt");
    }

    #[test]
    fn only_unknown_kinds_are_skippable() {
        assert!(!ProtocolError::Wire(WireError::UnknownKind("X".into())).is_fatal());
        assert!(ProtocolError::Wire(WireError::Malformed("x".into())).is_fatal());
        assert!(ProtocolError::Closed.is_fatal());
        assert!(ProtocolError::Timeout { what: "handshake" }.is_fatal());
    }

    #[test]
    fn exhausted_reports_attempts() {
        let err = ConnectError::Exhausted { attempted: 4 };
        assert_eq!(
            err.to_string(),
            "no peer accepted the connection after 4 attempts"
        );
    }

    #[test]
    fn node_error_wraps_store_error() {
        let err: NodeError = StoreError::NotFound { path: "x".into() }.into();
        assert!(matches!(err, NodeError::Store(_)));
    }
}
