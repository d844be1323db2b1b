//! Scripted event source for tests.

use super::EventSource;
use crate::error::EventSourceError;
use async_trait::async_trait;
use peersync_types::FileSystemEvent;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    pending: Vec<FileSystemEvent>,
    state: Vec<FileSystemEvent>,
}

/// Event source fed by hand.
///
/// Pushed events are reported once by the next `generate_sync_events`;
/// the state set with `set_state` is reported every time.
#[derive(Debug, Default)]
pub struct QueuedEventSource {
    inner: Mutex<Inner>,
}

impl QueuedEventSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a one-off change.
    pub fn push(&self, event: FileSystemEvent) {
        self.lock().pending.push(event);
    }

    /// Replace the reported full state.
    pub fn set_state(&self, events: Vec<FileSystemEvent>) {
        self.lock().state = events;
    }
}

#[async_trait]
impl EventSource for QueuedEventSource {
    async fn generate_sync_events(&self) -> Result<Vec<FileSystemEvent>, EventSourceError> {
        let mut inner = self.lock();
        let mut events = std::mem::take(&mut inner.pending);
        events.extend(inner.state.iter().cloned());
        Ok(events)
    }

    async fn current_state(&self) -> Result<Vec<FileSystemEvent>, EventSourceError> {
        Ok(self.lock().state.clone())
    }
}
