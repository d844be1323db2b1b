//! # peersync-peer
//!
//! Peer node for peersync.
//!
//! This crate implements a node that:
//! - Accepts TCP connections from other peers up to a configured limit
//! - Refuses the rest with the list of peers it is connected to, so they can
//!   join the mesh elsewhere
//! - Periodically broadcasts local changes as replication requests
//! - Pulls file content block by block from whichever peer announced it
//!
//! ## Architecture
//!
//! ```text
//! Peer A ──┐                     ┌── Peer C
//!          │    TCP + JSON       │
//!          ├────────────────────►│
//!          │                     │
//!      ┌───┴─────────────────────┴───┐
//!      │        peersync-peer        │
//!      │  ┌──────────────────────┐   │
//!      │  │  share/ (FileStore)  │   │
//!      │  └──────────────────────┘   │
//!      └─────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every frame is a 4-byte big-endian length followed by a JSON command:
//! - HANDSHAKE_REQUEST → HANDSHAKE_RESPONSE | CONNECTION_REFUSED
//! - FILE_{CREATE,MODIFY,DELETE}_REQUEST → matching response
//! - DIRECTORY_{CREATE,DELETE}_REQUEST → matching response
//! - FILE_BYTES_REQUEST → FILE_BYTES_RESPONSE (receiver pulls)
//! - HEARTBEAT (either side, when idle)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod storage;

pub use config::{Config, ConfigError};
pub use error::{NodeError, Result};
pub use events::{EventSource, QueuedEventSource, ScanEventSource};
pub use node::{Node, NodeMetrics};
pub use registry::{Direction, Mailbox, PeerHandle, PeerRegistry};
pub use storage::{FileStore, LocalFileStore, MemoryFileStore};
