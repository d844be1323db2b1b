//! Shared helpers for peer integration tests.
//!
//! Nodes listen on 127.0.0.1 with an ephemeral port and advertise the
//! same literal, so the address a test dials is the address the node
//! announces in handshakes and refusals.

#![allow(dead_code)]

use peersync_peer::protocol::{self, CommandSink, CommandStream};
use peersync_peer::{Config, EventSource, FileStore, MemoryFileStore, Node, QueuedEventSource};
use peersync_types::{Command, PeerAddress};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

/// Loopback config with short timeouts and no background cycle.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.node.advertised_name = "127.0.0.1".into();
    config.node.bind_host = "127.0.0.1".into();
    config.node.port = 0;
    config.sync.initial_sync_delay_secs = 0;
    config.sync.sync_interval_secs = 3600;
    config.timeouts.connect_timeout_secs = 2;
    config.timeouts.handshake_timeout_secs = 2;
    config
}

/// Route node logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bind a node and start accepting.
pub async fn start_node(
    config: Config,
    store: Arc<dyn FileStore>,
    events: Arc<dyn EventSource>,
) -> Arc<Node> {
    init_tracing();
    let (node, listener) = Node::bind(config, store, events).await.unwrap();
    node.spawn_accept_loop(listener);
    node
}

/// A node with an empty in-memory share.
pub async fn empty_node(config: Config) -> Arc<Node> {
    start_node(
        config,
        Arc::new(MemoryFileStore::new()),
        Arc::new(QueuedEventSource::new()),
    )
    .await
}

/// Poll `condition` until it holds, panicking after ten seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    wait_until_within(what, Duration::from_secs(10), condition).await
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_until_within(what: &str, limit: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Open a raw framed connection to `node`.
pub async fn dial(
    node: &Node,
) -> (CommandStream<OwnedReadHalf>, CommandSink<OwnedWriteHalf>) {
    let address = node.address();
    let stream = TcpStream::connect((address.host(), address.port()))
        .await
        .unwrap();
    protocol::split(stream)
}

/// A listener that refuses every handshake with a fixed peer list.
pub struct RefusingPeer {
    pub address: PeerAddress,
    listener: Option<TcpListener>,
    accepted: Arc<AtomicUsize>,
}

impl RefusingPeer {
    /// Reserve a port; call [`RefusingPeer::refuse_with`] to start serving.
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            address: PeerAddress::new("127.0.0.1", port),
            listener: Some(listener),
            accepted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve refusals listing `peers`.
    pub fn refuse_with(&mut self, peers: Vec<PeerAddress>) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let accepted = self.accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let peers = peers.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = protocol::split(stream);
                    if let Ok(Some(Command::HandshakeRequest(_))) = reader.recv().await {
                        let refusal = Command::connection_refused("connection limit reached", peers);
                        let _ = writer.send(&refusal).await;
                    }
                });
            }
        });
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}
