//! # peersync-core
//!
//! Pure logic for peersync (no I/O, instant tests).
//!
//! This crate implements the bookkeeping behind the replication protocol
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`ReconnectQueue`] decides which address to try next after a refusal
//! - [`TransferSession`] decides which chunk to pull next and when a file is complete
//! - [`OutgoingQueue`] turns local change events into request commands
//!
//! The actual I/O (sockets, files) is performed by `peersync-peer`, which
//! acts on the answers these types give.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod outgoing;
pub mod reconnect;
pub mod transfer;

pub use outgoing::{request_for, OutgoingQueue};
pub use reconnect::ReconnectQueue;
pub use transfer::{chunk_at, ends_file, ChunkRequest, Progress, TransferError, TransferSession};
