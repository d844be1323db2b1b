//! Per-connection tasks.
//!
//! A live connection runs two tasks. The writer drains the mailbox and
//! sends a heartbeat whenever it has been quiet for the heartbeat interval.
//! The reader decodes frames, feeds them to a [`Replicator`] and queues the
//! replies on the unbounded reply lane, so it never waits on the writer.
//! Whichever side fails first closes the handle; the reader then releases
//! unfinished transfers and leaves the registry.

use crate::error::ProtocolError;
use crate::node::Node;
use crate::protocol::{CommandSink, CommandStream};
use crate::registry::{Mailbox, PeerHandle};
use crate::replication::Replicator;
use peersync_types::Command;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Upper bound on flushing queued commands after close.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Start the tasks of an established connection.
///
/// The returned handle completes once the connection is torn down and
/// unregistered.
pub fn spawn<R, W>(
    node: Arc<Node>,
    handle: PeerHandle,
    reader: CommandStream<R>,
    writer: CommandSink<W>,
    mailbox: Mailbox,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_task = tokio::spawn(write_loop(node.clone(), handle.clone(), writer, mailbox));
    tokio::spawn(async move {
        let mut replicator = Replicator::new(node.clone(), handle.address().clone());
        read_loop(&node, &handle, reader, &mut replicator).await;

        handle.close();
        let _ = writer_task.await;
        replicator.abandon_all().await;
        node.registry().unregister(handle.address(), handle.id());
        tracing::info!("Disconnected from {}", handle.address());
    })
}

async fn write_loop<W>(
    node: Arc<Node>,
    handle: PeerHandle,
    mut writer: CommandSink<W>,
    mut mailbox: Mailbox,
) where
    W: AsyncWrite + Unpin,
{
    let heartbeat = node.config().timeouts.heartbeat();
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.closer().cancelled() => break,
            next = timeout(heartbeat, mailbox.recv()) => next,
        };
        let command = match next {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(_) => Command::Heartbeat,
        };
        if let Err(e) = writer.send(&command).await {
            tracing::debug!("Send to {} failed: {}", handle.address(), e);
            handle.close();
            return;
        }
        node.metrics().commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Commands queued just before close, such as INVALID_PROTOCOL.
    let flush = async {
        while let Some(command) = mailbox.try_recv() {
            if writer.send(&command).await.is_err() {
                break;
            }
            node.metrics().commands_sent.fetch_add(1, Ordering::Relaxed);
        }
    };
    let _ = timeout(FLUSH_TIMEOUT, flush).await;
}

async fn read_loop<R>(
    node: &Node,
    handle: &PeerHandle,
    mut reader: CommandStream<R>,
    replicator: &mut Replicator,
) where
    R: AsyncRead + Unpin,
{
    let idle = node.config().timeouts.idle();
    let peer = handle.address();

    loop {
        let received = tokio::select! {
            _ = handle.closer().cancelled() => return,
            received = timeout(idle, reader.recv()) => received,
        };
        let command = match received {
            Ok(Ok(Some(command))) => command,
            Ok(Ok(None)) => {
                tracing::debug!("{} closed the connection", peer);
                return;
            }
            Ok(Err(e)) if !e.is_fatal() => {
                node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Skipping frame from {}: {}", peer, e);
                continue;
            }
            Ok(Err(e)) => {
                node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Closing {}: {}", peer, e);
                if let ProtocolError::Wire(wire) = &e {
                    handle.reply(Command::invalid_protocol(wire.to_string()));
                }
                return;
            }
            Err(_) => {
                tracing::warn!("{} silent for {:?}, closing", peer, idle);
                return;
            }
        };

        node.metrics().commands_received.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("{} -> {}", peer, command.kind());
        for reply in replicator.handle(command).await {
            if !handle.reply(reply) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::QueuedEventSource;
    use crate::registry::Direction;
    use crate::storage::MemoryFileStore;
    use peersync_types::{DirectoryRequest, PeerAddress};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        node: Arc<Node>,
        task: JoinHandle<()>,
        remote_reader: CommandStream<ReadHalf<DuplexStream>>,
        remote_writer: WriteHalf<DuplexStream>,
    }

    fn harness(config: Config) -> Harness {
        let node = Node::new(
            config,
            PeerAddress::new("localhost", 1),
            Arc::new(MemoryFileStore::new()),
            Arc::new(QueuedEventSource::new()),
        );
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let (handle, mailbox) = PeerHandle::channel(
            PeerAddress::new("remote", 2),
            Direction::Inbound,
            16,
            node.shutdown_token().child_token(),
        );
        assert!(node.registry().register(handle.clone()));
        let task = spawn(
            node.clone(),
            handle,
            CommandStream::new(local_read),
            CommandSink::new(local_write),
            mailbox,
        );
        Harness {
            node,
            task,
            remote_reader: CommandStream::new(remote_read),
            remote_writer: remote_write,
        }
    }

    async fn write_raw(writer: &mut WriteHalf<DuplexStream>, payload: &[u8]) {
        let len = payload.len() as u32;
        writer.write_all(&len.to_be_bytes()).await.unwrap();
        writer.write_all(payload).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_is_answered_and_closes() {
        let mut h = harness(Config::default());
        write_raw(&mut h.remote_writer, b"{not json").await;

        let reply = h.remote_reader.recv().await.unwrap();
        assert!(matches!(reply, Some(Command::InvalidProtocol(_))));
        h.task.await.unwrap();

        assert!(h.node.registry().is_empty());
        assert_eq!(h.node.metrics().protocol_errors.load(Ordering::Relaxed), 1);
        assert!(matches!(h.remote_reader.recv().await, Ok(None)));
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped() {
        let mut h = harness(Config::default());
        write_raw(&mut h.remote_writer, br#"{"command":"FROBNICATE"}"#).await;

        let request = Command::DirectoryCreateRequest(DirectoryRequest {
            path_name: "d".into(),
        });
        write_raw(&mut h.remote_writer, &request.to_bytes().unwrap()).await;

        let reply = h.remote_reader.recv().await.unwrap();
        assert!(matches!(reply, Some(Command::DirectoryCreateResponse(_))));
        assert_eq!(h.node.registry().len(), 1);
        assert_eq!(h.node.metrics().protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reader_keeps_draining_while_writer_is_blocked() {
        let mut h = harness(Config::default());
        let request = Command::DirectoryCreateRequest(DirectoryRequest {
            path_name: "d".into(),
        })
        .to_bytes()
        .unwrap();

        // Nothing reads the replies, so the writer stalls on a full pipe.
        let flood = async {
            for _ in 0..2000 {
                write_raw(&mut h.remote_writer, &request).await;
            }
            while h.node.metrics().commands_received.load(Ordering::Relaxed) < 2000 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(10), flood)
            .await
            .expect("reader stopped draining");
        assert_eq!(h.node.registry().len(), 1);
    }

    #[tokio::test]
    async fn quiet_writer_sends_heartbeat() {
        let mut config = Config::default();
        config.timeouts.heartbeat_interval_secs = 1;
        let mut h = harness(config);

        let reply = timeout(Duration::from_secs(5), h.remote_reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Some(Command::Heartbeat));
    }

    #[tokio::test]
    async fn peer_hangup_unregisters() {
        let h = harness(Config::default());
        drop(h.remote_writer);
        drop(h.remote_reader);

        h.task.await.unwrap();
        assert!(h.node.registry().is_empty());
    }

    #[tokio::test]
    async fn node_shutdown_ends_connection() {
        let h = harness(Config::default());
        h.node.shutdown();
        h.task.await.unwrap();
        assert!(h.node.registry().is_empty());
    }
}
