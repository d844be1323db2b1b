//! Node coordination.
//!
//! A [`Node`] owns everything shared between connections: the peer
//! registry, the storage capability, the event source, the outgoing queue
//! and the metrics. Connection tasks hold an `Arc<Node>`.

use crate::config::Config;
use crate::error::{ConnectError, NodeError, Result};
use crate::events::EventSource;
use crate::handshake;
use crate::registry::{PeerHandle, PeerRegistry};
use crate::scheduler;
use crate::storage::FileStore;
use futures_util::future::join_all;
use peersync_core::OutgoingQueue;
use peersync_types::{Command, PeerAddress};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Operational counters for a node.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct NodeMetrics {
    /// Inbound peers admitted.
    pub connections_accepted: AtomicU64,
    /// Inbound peers refused for capacity.
    pub connections_refused: AtomicU64,
    /// Outbound connections established.
    pub connections_outbound: AtomicU64,
    /// Commands written to sockets, heartbeats included.
    pub commands_sent: AtomicU64,
    /// Commands decoded from sockets.
    pub commands_received: AtomicU64,
    /// `FILE_BYTES_REQUEST`s issued.
    pub byte_requests_sent: AtomicU64,
    /// `FILE_BYTES_RESPONSE`s issued.
    pub byte_responses_sent: AtomicU64,
    /// Files received and committed.
    pub transfers_completed: AtomicU64,
    /// Transfers abandoned or rejected at commit.
    pub transfers_failed: AtomicU64,
    /// Frames that were malformed, unknown or out of place.
    pub protocol_errors: AtomicU64,
}

/// A peersync node.
pub struct Node {
    config: Config,
    address: PeerAddress,
    registry: PeerRegistry,
    store: Arc<dyn FileStore>,
    events: Arc<dyn EventSource>,
    metrics: NodeMetrics,
    /// Commands of the running synchronization cycle.
    outgoing: Mutex<OutgoingQueue>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .field("peers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node that advertises `address`.
    pub fn new(
        config: Config,
        address: PeerAddress,
        store: Arc<dyn FileStore>,
        events: Arc<dyn EventSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            address,
            registry: PeerRegistry::new(),
            store,
            events,
            metrics: NodeMetrics::default(),
            outgoing: Mutex::new(OutgoingQueue::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Validate `config`, open the listening socket and create the node.
    ///
    /// The advertised port is the one actually bound, so port 0 works.
    pub async fn bind(
        config: Config,
        store: Arc<dyn FileStore>,
        events: Arc<dyn EventSource>,
    ) -> Result<(Arc<Self>, TcpListener)> {
        config.validate()?;
        let bind_address = format!("{}:{}", config.node.bind_host, config.node.port);
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|source| NodeError::Bind {
                address: bind_address.clone(),
                source,
            })?;
        let port = listener.local_addr()?.port();
        let address = PeerAddress::new(config.node.advertised_name.clone(), port);
        Ok((Self::new(config, address, store, events), listener))
    }

    /// Get the node configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address advertised in handshakes.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Live connections.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Storage capability.
    pub fn store(&self) -> &dyn FileStore {
        self.store.as_ref()
    }

    /// Change detector.
    pub fn events(&self) -> &dyn EventSource {
        self.events.as_ref()
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Outgoing queue of the synchronization cycle.
    pub fn outgoing(&self) -> &Mutex<OutgoingQueue> {
        &self.outgoing
    }

    /// Token cancelled when the node shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stop accepting, stop synchronizing and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all();
    }

    /// Accept inbound connections until shutdown.
    pub fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!("Incoming connection from {}", remote);
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handshake::accept(node, stream).await {
                                tracing::debug!("Handshake with {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            tracing::debug!("Accept loop stopped");
        })
    }

    /// Dial `address`, following refusals to other peers.
    pub async fn connect(
        self: &Arc<Self>,
        address: PeerAddress,
    ) -> std::result::Result<PeerHandle, ConnectError> {
        handshake::connect(self, address).await
    }

    /// Dial every configured peer. Returns how many connected.
    pub async fn connect_configured(self: &Arc<Self>) -> Result<usize> {
        let mut connected = 0;
        for address in self.config.peer_addresses()? {
            match self.connect(address.clone()).await {
                Ok(handle) => {
                    tracing::info!("Joined {} via {}", handle.address(), address);
                    connected += 1;
                }
                Err(e) => tracing::warn!("Could not join {}: {}", address, e),
            }
        }
        Ok(connected)
    }

    /// Queue `commands` on every live connection, in order.
    ///
    /// Returns how many connections took the whole batch.
    pub async fn broadcast(&self, commands: &[Command]) -> usize {
        let handles = self.registry.handles();
        let delivered = join_all(handles.iter().map(|handle| async move {
            for command in commands {
                if !handle.send(command.clone()).await {
                    return false;
                }
            }
            true
        }))
        .await;
        delivered.into_iter().filter(|ok| *ok).count()
    }

    /// Serve until [`Node::shutdown`] is called.
    ///
    /// Accepts inbound peers, dials the configured ones and runs the
    /// synchronization cycle.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Listening on {} as {}", listener.local_addr()?, self.address);
        let accept = self.spawn_accept_loop(listener);
        let sync = scheduler::spawn_sync_task(self.clone());

        let connected = self.connect_configured().await?;
        tracing::info!("Connected to {} configured peers", connected);

        self.shutdown.cancelled().await;
        self.registry.close_all();
        let _ = accept.await;
        let _ = sync.await;
        tracing::info!("Node {} stopped", self.address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueuedEventSource;
    use crate::registry::{Direction, Mailbox};
    use crate::storage::MemoryFileStore;

    fn test_node() -> Arc<Node> {
        Node::new(
            Config::default(),
            PeerAddress::new("localhost", 1),
            Arc::new(MemoryFileStore::new()),
            Arc::new(QueuedEventSource::new()),
        )
    }

    fn attach(node: &Node, port: u16) -> Mailbox {
        let (handle, mailbox) = PeerHandle::channel(
            PeerAddress::new("peer", port),
            Direction::Inbound,
            8,
            node.shutdown_token().child_token(),
        );
        node.registry().register(handle);
        mailbox
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer_in_order() {
        let node = test_node();
        let mut a = attach(&node, 2);
        let mut b = attach(&node, 3);

        let batch = vec![Command::Heartbeat, Command::invalid_protocol("x")];
        assert_eq!(node.broadcast(&batch).await, 2);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await, Some(Command::Heartbeat));
            assert_eq!(rx.recv().await, Some(Command::invalid_protocol("x")));
        }
    }

    #[tokio::test]
    async fn broadcast_skips_closed_peers() {
        let node = test_node();
        let _a = attach(&node, 2);
        drop(attach(&node, 3));

        assert_eq!(node.broadcast(&[Command::Heartbeat]).await, 1);
    }

    #[tokio::test]
    async fn bind_advertises_bound_port() {
        let mut config = Config::default();
        config.node.bind_host = "127.0.0.1".into();
        config.node.port = 0;
        let (node, listener) = Node::bind(
            config,
            Arc::new(MemoryFileStore::new()),
            Arc::new(QueuedEventSource::new()),
        )
        .await
        .unwrap();

        assert_eq!(node.address().port(), listener.local_addr().unwrap().port());
        assert_ne!(node.address().port(), 0);
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let mut config = Config::default();
        config.sync.block_size = 0;
        let result = Node::bind(
            config,
            Arc::new(MemoryFileStore::new()),
            Arc::new(QueuedEventSource::new()),
        )
        .await;
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let node = test_node();
        let _rx = attach(&node, 2);
        node.shutdown();
        assert!(node.registry().handles().iter().all(PeerHandle::is_closed));
    }
}
