//! Stream framing for peersync connections.
//!
//! Every command travels as one frame: a 4-byte big-endian length followed
//! by the JSON document. The same framing applies to both directions and to
//! the handshake as well as everything after it.

use crate::error::{ProtocolError, ProtocolResult};
use futures_util::{SinkExt, StreamExt};
use peersync_types::Command;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Largest frame accepted or sent (8 MiB).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Room left in a frame for the fields around a chunk's content.
pub const FRAME_OVERHEAD: usize = 64 * 1024;

/// Whether a chunk of `block_size` bytes still fits in one frame after
/// base64 encoding.
pub fn fits_frame(block_size: u64) -> bool {
    block_size
        .div_ceil(3)
        .checked_mul(4)
        .and_then(|encoded| encoded.checked_add(FRAME_OVERHEAD as u64))
        .is_some_and(|total| total <= MAX_FRAME_SIZE as u64)
}

/// Largest chunk that fits in one frame.
pub fn max_chunk_len() -> u64 {
    ((MAX_FRAME_SIZE - FRAME_OVERHEAD) / 4 * 3) as u64
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Framed writer for sending commands.
pub struct CommandSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> CommandSink<W> {
    /// Wrap a byte writer.
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    /// Send one command (length-prefixed).
    pub async fn send(&mut self, command: &Command) -> ProtocolResult<()> {
        let bytes = command.to_bytes()?;
        self.inner.send(Bytes::from(bytes)).await?;
        Ok(())
    }
}

/// Framed reader for receiving commands.
pub struct CommandStream<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> CommandStream<R> {
    /// Wrap a byte reader.
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Receive the next command, or `None` once the stream is closed.
    ///
    /// A frame that does not decode yields [`ProtocolError::Wire`]; the
    /// stream stays usable and the caller decides whether to go on.
    pub async fn recv(&mut self) -> ProtocolResult<Option<Command>> {
        match self.inner.next().await {
            Some(Ok(bytes)) => Ok(Some(Command::from_bytes(&bytes)?)),
            Some(Err(e)) => Err(ProtocolError::Transport(e)),
            None => Ok(None),
        }
    }
}

/// Split a TCP stream into a framed reader and writer.
pub fn split(stream: TcpStream) -> (CommandStream<OwnedReadHalf>, CommandSink<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (CommandStream::new(read), CommandSink::new(write))
}
