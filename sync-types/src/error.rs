//! Error types for the peersync wire codec.

use thiserror::Error;

/// Errors produced when encoding or decoding a [`Command`](crate::Command).
#[derive(Debug, Error)]
pub enum WireError {
    /// Payload is not a well-formed command document.
    ///
    /// The connection that produced it can no longer be trusted.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Well-formed document carrying a `command` this node does not know.
    #[error("unknown command kind: {0}")]
    UnknownKind(String),

    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),
}

impl WireError {
    /// Whether the stream that carried this message must be closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::UnknownKind(_))
    }
}
