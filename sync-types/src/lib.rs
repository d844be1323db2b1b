//! # peersync-types
//!
//! Wire format types for the peersync replication protocol.
//!
//! This crate provides the foundational types used across all peersync crates:
//! - [`PeerAddress`], [`ConnectionId`] - Peer identity types
//! - [`Command`] - Protocol commands exchanged between peers, and their JSON codec
//! - [`FileMeta`], [`FileSystemEvent`] - File descriptors and local change events
//! - [`WireError`] - Codec error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod error;
mod event;
mod messages;

pub use address::{AddressParseError, ConnectionId, PeerAddress};
pub use error::WireError;
pub use event::{content_identity, EventKind, FileMeta, FileSystemEvent};
pub use messages::{
    BytesRequest, BytesResponse, Command, ConnectionRefused, DirectoryRequest, DirectoryResponse,
    FileRequest, FileResponse, Handshake, Notice, Status, COMMAND_KINDS,
};
