//! Outgoing command queue for one synchronization cycle.
//!
//! Each cycle the scheduler fills the queue from the event source, hands the
//! drained commands to every connection, and starts the next cycle empty:
//! 1. `extend_events()` - translate local changes into requests
//! 2. `drain()` - take everything, leaving the queue empty
//!
//! Order is preserved, so a directory create queued before the files inside
//! it reaches every peer first.

use peersync_types::{Command, DirectoryRequest, EventKind, FileRequest, FileSystemEvent};

/// The request that announces `event` to a peer.
///
/// Returns `None` for a file event without a descriptor, which cannot be
/// expressed on the wire.
pub fn request_for(event: &FileSystemEvent) -> Option<Command> {
    let path_name = event.path.clone();
    let file = || {
        event.meta.clone().map(|file_descriptor| FileRequest {
            path_name: path_name.clone(),
            file_descriptor,
        })
    };

    match event.kind {
        EventKind::FileCreate => file().map(Command::FileCreateRequest),
        EventKind::FileModify => file().map(Command::FileModifyRequest),
        EventKind::FileDelete => file().map(Command::FileDeleteRequest),
        EventKind::DirectoryCreate => Some(Command::DirectoryCreateRequest(DirectoryRequest {
            path_name: path_name.clone(),
        })),
        EventKind::DirectoryDelete => Some(Command::DirectoryDeleteRequest(DirectoryRequest {
            path_name: path_name.clone(),
        })),
    }
}

/// FIFO of commands waiting to be broadcast.
#[derive(Debug, Clone, Default)]
pub struct OutgoingQueue {
    commands: Vec<Command>,
}

impl OutgoingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Append the request for `event`.
    ///
    /// Returns `false` if the event has no wire form and was skipped.
    pub fn push_event(&mut self, event: &FileSystemEvent) -> bool {
        match request_for(event) {
            Some(command) => {
                self.push(command);
                true
            }
            None => false,
        }
    }

    /// Append the requests for a batch of events.
    ///
    /// Returns how many were skipped.
    pub fn extend_events<'a>(&mut self, events: impl IntoIterator<Item = &'a FileSystemEvent>) -> usize {
        events
            .into_iter()
            .filter(|event| !self.push_event(event))
            .count()
    }

    /// Take every queued command, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}
