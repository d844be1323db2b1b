//! Sources of local change events.
//!
//! The scheduler asks an [`EventSource`] what changed in the shared
//! directory and forwards the answer to every peer.

mod queued;
mod scan;

pub use queued::QueuedEventSource;
pub use scan::ScanEventSource;

use crate::error::EventSourceError;
use async_trait::async_trait;
use peersync_types::FileSystemEvent;

/// Trait for change detectors.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Changes since the previous call, followed by the full current state
    /// as create events (directories before files).
    async fn generate_sync_events(&self) -> Result<Vec<FileSystemEvent>, EventSourceError>;

    /// The full current state as create events, without consuming pending
    /// changes.
    async fn current_state(&self) -> Result<Vec<FileSystemEvent>, EventSourceError>;
}
