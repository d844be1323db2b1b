//! File descriptors and local change events.

use serde::{Deserialize, Serialize};

/// Descriptor of one version of a file.
///
/// Travels with every file request so the receiver can decide whether the
/// incoming version wins and can verify the transferred content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    /// Hex-encoded BLAKE3 hash of the content.
    pub identity: String,
    /// Modification time, milliseconds since the Unix epoch.
    pub last_modified: u64,
    /// Content length in bytes.
    pub file_size: u64,
}

impl FileMeta {
    /// Create a new FileMeta.
    pub fn new(identity: impl Into<String>, last_modified: u64, file_size: u64) -> Self {
        Self {
            identity: identity.into(),
            last_modified,
            file_size,
        }
    }

    /// Describe in-memory content.
    pub fn of_content(content: &[u8], last_modified: u64) -> Self {
        Self::new(content_identity(content), last_modified, content.len() as u64)
    }

    /// Whether this version wins over `other` under last-writer-wins.
    pub fn is_newer_than(&self, other: &FileMeta) -> bool {
        self.last_modified > other.last_modified
    }
}

/// Content identity used throughout the protocol: hex BLAKE3.
pub fn content_identity(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

/// Kind of local change reported by an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A file appeared.
    FileCreate,
    /// A file's content changed.
    FileModify,
    /// A file disappeared.
    FileDelete,
    /// A directory appeared.
    DirectoryCreate,
    /// A directory disappeared.
    DirectoryDelete,
}

/// A change in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemEvent {
    /// What happened.
    pub kind: EventKind,
    /// Path relative to the share root, `/`-separated.
    pub path: String,
    /// Descriptor of the file; `None` for directory events.
    pub meta: Option<FileMeta>,
}

impl FileSystemEvent {
    /// A file event.
    pub fn file(kind: EventKind, path: impl Into<String>, meta: FileMeta) -> Self {
        Self {
            kind,
            path: path.into(),
            meta: Some(meta),
        }
    }

    /// A directory event.
    pub fn directory(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            meta: None,
        }
    }
}
