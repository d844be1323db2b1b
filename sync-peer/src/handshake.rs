//! Connection establishment.
//!
//! The dialing side sends `HANDSHAKE_REQUEST` and waits for one frame. A
//! `HANDSHAKE_RESPONSE` means the connection is live; a
//! `CONNECTION_REFUSED` lists the responder's peers, which are tried next.
//! The accepting side checks capacity and uniqueness before it answers.
//! When two nodes dial each other at once, both keep the connection dialed
//! by the lower address, and a dial that loses returns the survivor.

use crate::connection;
use crate::error::{ConnectError, ProtocolError, ProtocolResult};
use crate::node::Node;
use crate::protocol::{self, CommandSink, CommandStream};
use crate::registry::{Admission, Direction, PeerHandle};
use crate::scheduler;
use peersync_core::ReconnectQueue;
use peersync_types::{Command, PeerAddress};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Result of dialing one candidate.
enum Attempt {
    Joined(PeerHandle),
    Refused(Vec<PeerAddress>),
    Failed,
}

/// Dial `origin`, following `CONNECTION_REFUSED` lists until some peer
/// accepts. Each address is dialed at most once.
pub async fn connect(node: &Arc<Node>, origin: PeerAddress) -> Result<PeerHandle, ConnectError> {
    if node.registry().contains(&origin) {
        return Err(ConnectError::AlreadyConnected { address: origin });
    }

    let mut queue = ReconnectQueue::new();
    queue.exclude(node.address().clone());
    for address in node.registry().snapshot() {
        queue.exclude(address);
    }
    queue.offer(origin);

    while let Some(candidate) = queue.pop() {
        match attempt(node, &candidate).await? {
            Attempt::Joined(handle) => return Ok(handle),
            Attempt::Refused(peers) => {
                let offered = queue.offer_all(peers);
                tracing::info!("{} refused us; {} new candidates", candidate, offered);
            }
            Attempt::Failed => {}
        }
    }

    Err(ConnectError::Exhausted {
        attempted: queue.attempted(),
    })
}

async fn attempt(node: &Arc<Node>, candidate: &PeerAddress) -> Result<Attempt, ConnectError> {
    let timeouts = &node.config().timeouts;
    let dial = TcpStream::connect((candidate.host(), candidate.port()));
    let stream = match timeout(timeouts.connect(), dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!("Cannot reach {}: {}", candidate, e);
            return Ok(Attempt::Failed);
        }
        Err(_) => {
            tracing::debug!("Timed out dialing {}", candidate);
            return Ok(Attempt::Failed);
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = protocol::split(stream);

    let reply = async {
        writer
            .send(&Command::handshake_request(node.address().clone()))
            .await?;
        reader.recv().await
    };
    let reply = match timeout(timeouts.handshake(), reply).await {
        Ok(Ok(Some(reply))) => reply,
        Ok(Ok(None)) => {
            tracing::debug!("{} closed during handshake", candidate);
            return Ok(Attempt::Failed);
        }
        Ok(Err(e)) => {
            tracing::debug!("Handshake with {} failed: {}", candidate, e);
            return Ok(Attempt::Failed);
        }
        Err(_) => {
            tracing::debug!("Handshake with {} timed out", candidate);
            return Ok(Attempt::Failed);
        }
    };

    match reply {
        Command::HandshakeResponse(handshake) => {
            tracing::debug!("{} answered as {}", candidate, handshake.host_port);
            let handle = establish(node, candidate.clone(), reader, writer);
            Ok(Attempt::Joined(handle))
        }
        Command::ConnectionRefused(refusal) => {
            tracing::debug!("{} refused: {}", candidate, refusal.message);
            Ok(Attempt::Refused(refusal.peers))
        }
        Command::InvalidProtocol(notice) => match node.registry().get(candidate) {
            // Our dial crossed one from the candidate and lost the tie-break.
            Some(existing) => Ok(Attempt::Joined(existing)),
            None => {
                tracing::warn!("{} rejected the handshake: {}", candidate, notice.message);
                node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
                Ok(Attempt::Failed)
            }
        },
        other => {
            tracing::warn!("{} answered the handshake with {}", candidate, other.kind());
            node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
            Ok(Attempt::Failed)
        }
    }
}

/// Register an outbound connection and start its tasks.
fn establish(
    node: &Arc<Node>,
    address: PeerAddress,
    reader: CommandStream<OwnedReadHalf>,
    writer: CommandSink<OwnedWriteHalf>,
) -> PeerHandle {
    let (handle, mailbox) = PeerHandle::channel(
        address.clone(),
        Direction::Outbound,
        node.config().node.outbox_capacity,
        node.shutdown_token().child_token(),
    );
    let kept = node.registry().register_dialed(handle.clone(), node.address());
    if kept.id() != handle.id() {
        tracing::debug!("Keeping the connection {} dialed to us", address);
        return kept;
    }

    node.metrics().connections_outbound.fetch_add(1, Ordering::Relaxed);
    tracing::info!("Connected to {}", address);
    connection::spawn(node.clone(), handle.clone(), reader, writer, mailbox);
    scheduler::schedule_initial_push(node.clone(), handle.clone(), Duration::ZERO);
    handle
}

/// Run the accepting side of the handshake on a fresh inbound stream.
pub async fn accept(node: Arc<Node>, stream: TcpStream) -> ProtocolResult<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = protocol::split(stream);

    let first = timeout(node.config().timeouts.handshake(), reader.recv())
        .await
        .map_err(|_| ProtocolError::Timeout { what: "handshake" })?;
    let address = match first {
        Ok(Some(Command::HandshakeRequest(handshake))) => handshake.host_port,
        Ok(Some(other)) => {
            node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
            let _ = writer
                .send(&Command::invalid_protocol(format!(
                    "expected HANDSHAKE_REQUEST, got {}",
                    other.kind()
                )))
                .await;
            return Err(ProtocolError::UnexpectedCommand {
                expected: "HANDSHAKE_REQUEST",
                actual: other.kind(),
            });
        }
        Ok(None) => return Err(ProtocolError::Closed),
        Err(e) => {
            node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
            if let ProtocolError::Wire(wire) = &e {
                let _ = writer.send(&Command::invalid_protocol(wire.to_string())).await;
            }
            return Err(e);
        }
    };

    let (handle, mailbox) = PeerHandle::channel(
        address.clone(),
        Direction::Inbound,
        node.config().node.outbox_capacity,
        node.shutdown_token().child_token(),
    );

    match node.registry().admit(
        handle.clone(),
        node.config().node.max_incoming_connections,
        node.address(),
    ) {
        Admission::AtCapacity(peers) => {
            node.metrics().connections_refused.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Refusing {}: {} peers connected", address, peers.len());
            writer
                .send(&Command::connection_refused("connection limit reached", peers))
                .await?;
            Ok(())
        }
        Admission::Duplicate => {
            node.metrics().protocol_errors.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Rejecting duplicate connection from {}", address);
            writer
                .send(&Command::invalid_protocol("peer already connected"))
                .await?;
            Ok(())
        }
        Admission::Admitted => {
            if let Err(e) = writer
                .send(&Command::handshake_response(node.address().clone()))
                .await
            {
                node.registry().unregister(&address, handle.id());
                return Err(e);
            }
            node.metrics().connections_accepted.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Accepted {}", address);

            let delay = Duration::from_secs(node.config().sync.initial_sync_delay_secs);
            connection::spawn(node.clone(), handle.clone(), reader, writer, mailbox);
            scheduler::schedule_initial_push(node, handle, delay);
            Ok(())
        }
    }
}
