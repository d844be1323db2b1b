//! Chunked file transfer bookkeeping.
//!
//! Content moves as a strict ping-pong on one connection: the receiver asks
//! for a chunk, the sender answers with it, the receiver asks for the next
//! one. A [`TransferSession`] is the receiver's record of one such exchange:
//! it checks every chunk lands exactly where the previous one ended and
//! says what to ask for next.

use peersync_types::FileMeta;
use thiserror::Error;

/// A byte range to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Offset of the first byte.
    pub position: u64,
    /// Number of bytes.
    pub length: u64,
}

/// The chunk starting at `position`, or `None` once the file is covered.
///
/// Chunks are `block_size` long except the last, which is whatever remains.
pub fn chunk_at(position: u64, file_size: u64, block_size: u64) -> Option<ChunkRequest> {
    if position >= file_size || block_size == 0 {
        return None;
    }
    Some(ChunkRequest {
        position,
        length: block_size.min(file_size - position),
    })
}

/// Whether a chunk reaches the end of a file of `file_size` bytes.
pub fn ends_file(position: u64, length: u64, file_size: u64) -> bool {
    position.saturating_add(length) >= file_size
}

/// What the receiver does after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Ask for this chunk next.
    Next(ChunkRequest),
    /// Every byte has arrived; verify and commit the file.
    Complete,
}

/// A chunk that cannot be part of the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Chunk does not start where the previous one ended.
    #[error("chunk out of order: expected position {expected}, got {actual}")]
    OutOfOrder {
        /// Bytes received so far.
        expected: u64,
        /// Position of the offending chunk.
        actual: u64,
    },

    /// Declared length disagrees with the bytes carried.
    #[error("chunk length mismatch: declared {declared}, carried {carried}")]
    LengthMismatch {
        /// The `length` field.
        declared: u64,
        /// Bytes actually present.
        carried: u64,
    },

    /// Chunk extends past the end of the file.
    #[error("chunk overruns file: ends at {end}, file is {file_size} bytes")]
    Overrun {
        /// End offset of the chunk.
        end: u64,
        /// Expected file length.
        file_size: u64,
    },

    /// Sender declared the file finished before every byte arrived.
    #[error("transfer incomplete: {received} of {file_size} bytes")]
    Incomplete {
        /// Bytes received.
        received: u64,
        /// Expected file length.
        file_size: u64,
    },

    /// Sender returned no bytes and did not finish.
    #[error("transfer stalled at {received} bytes")]
    Stalled {
        /// Bytes received.
        received: u64,
    },
}

/// Receiver-side state of one in-flight file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    meta: FileMeta,
    received: u64,
    block_size: u64,
}

impl TransferSession {
    /// Start tracking a transfer of `meta`.
    pub fn new(meta: FileMeta, block_size: u64) -> Self {
        Self {
            meta,
            received: 0,
            block_size,
        }
    }

    /// The chunk that opens a transfer of `meta`, `None` for an empty file.
    pub fn first_chunk(meta: &FileMeta, block_size: u64) -> Option<ChunkRequest> {
        chunk_at(0, meta.file_size, block_size)
    }

    /// Account for a chunk of `carried` bytes and decide what comes next.
    ///
    /// On error the session must be abandoned; its state is unchanged.
    pub fn accept(
        &mut self,
        position: u64,
        length: u64,
        carried: u64,
        done: bool,
    ) -> Result<Progress, TransferError> {
        if position != self.received {
            return Err(TransferError::OutOfOrder {
                expected: self.received,
                actual: position,
            });
        }
        if length != carried {
            return Err(TransferError::LengthMismatch {
                declared: length,
                carried,
            });
        }

        let file_size = self.meta.file_size;
        let end = position.saturating_add(length);
        if end > file_size {
            return Err(TransferError::Overrun { end, file_size });
        }
        if done && end != file_size {
            return Err(TransferError::Incomplete {
                received: end,
                file_size,
            });
        }
        if !done && length == 0 && end < file_size {
            return Err(TransferError::Stalled { received: end });
        }

        self.received = end;
        match chunk_at(self.received, file_size, self.block_size) {
            Some(next) if !done => Ok(Progress::Next(next)),
            _ => Ok(Progress::Complete),
        }
    }

    /// Version being transferred.
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }
}
