//! Registry of live peer connections.
//!
//! At most one connection per advertised address. Admission of inbound
//! peers checks capacity and uniqueness and registers in one step, so two
//! handshakes racing for the last slot cannot both succeed.
//!
//! Two nodes that dial each other at the same moment end up with one
//! connection in each direction. Both sides keep the connection dialed by
//! the lower address and close the other.

use peersync_types::{Command, ConnectionId, PeerAddress};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer dialed us.
    Inbound,
    /// We dialed the peer.
    Outbound,
}

/// The registry-visible face of one connection.
///
/// Cheap to clone; every clone talks to the same connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    address: PeerAddress,
    direction: Direction,
    outbox: mpsc::Sender<Command>,
    replies: mpsc::UnboundedSender<Command>,
    closer: CancellationToken,
}

/// Receiving end of a connection's queues, owned by its writer.
///
/// Replies to the peer's requests go out before queued pushes.
#[derive(Debug)]
pub struct Mailbox {
    outbox: mpsc::Receiver<Command>,
    replies: mpsc::UnboundedReceiver<Command>,
}

impl Mailbox {
    /// Next command to write, replies first.
    ///
    /// Returns `None` once every handle is gone and both queues are empty.
    pub async fn recv(&mut self) -> Option<Command> {
        tokio::select! {
            biased;
            Some(reply) = self.replies.recv() => Some(reply),
            next = self.outbox.recv() => next,
        }
    }

    /// Take a queued command without waiting.
    pub fn try_recv(&mut self) -> Option<Command> {
        self.replies
            .try_recv()
            .or_else(|_| self.outbox.try_recv())
            .ok()
    }
}

impl PeerHandle {
    /// Create a handle for a new connection and the mailbox its writer
    /// drains. At most `capacity` pushed commands wait in the outbox.
    pub fn channel(
        address: PeerAddress,
        direction: Direction,
        capacity: usize,
        closer: CancellationToken,
    ) -> (Self, Mailbox) {
        let (outbox, outbox_rx) = mpsc::channel(capacity);
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::new(),
            address,
            direction,
            outbox,
            replies,
            closer,
        };
        let mailbox = Mailbox {
            outbox: outbox_rx,
            replies: replies_rx,
        };
        (handle, mailbox)
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Advertised address of the peer.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Which side dialed.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Address of the node that dialed this connection.
    fn dialer<'a>(&'a self, local: &'a PeerAddress) -> &'a PeerAddress {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => &self.address,
        }
    }

    /// Queue a pushed command for the connection's writer.
    ///
    /// Waits while the outbox is full. Returns `false` if the connection
    /// has already shut down.
    pub async fn send(&self, command: Command) -> bool {
        self.outbox.send(command).await.is_ok()
    }

    /// Queue a reply to the peer. Never waits, so the reader that calls it
    /// keeps draining the socket while the writer is blocked.
    pub fn reply(&self, command: Command) -> bool {
        self.replies.send(command).is_ok()
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Whether shutdown was requested.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.outbox.is_closed()
    }

    /// Token cancelled when the connection shuts down.
    pub fn closer(&self) -> &CancellationToken {
        &self.closer
    }
}

/// Whether `candidate` replaces `existing`, both linking `local` to the
/// same peer. Only crossed connections compete; the lower dialer wins.
fn supersedes(local: &PeerAddress, existing: &PeerHandle, candidate: &PeerHandle) -> bool {
    existing.direction() != candidate.direction()
        && candidate.dialer(local) < existing.dialer(local)
}

/// Outcome of an inbound admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Registered.
    Admitted,
    /// The node is full; carries the addresses connected at decision time.
    AtCapacity(Vec<PeerAddress>),
    /// A connection to the address already exists.
    Duplicate,
}

#[derive(Debug, Default)]
struct Inner {
    /// Registration order.
    order: Vec<PeerAddress>,
    handles: HashMap<PeerAddress, PeerHandle>,
}

impl Inner {
    fn insert(&mut self, handle: PeerHandle) -> bool {
        if self.handles.contains_key(handle.address()) {
            return false;
        }
        self.order.push(handle.address().clone());
        self.handles.insert(handle.address().clone(), handle);
        true
    }

    /// Swap in `handle` for the connection to the same address, closing
    /// the old one. Registration order is kept.
    fn replace(&mut self, handle: PeerHandle) {
        if let Some(old) = self.handles.insert(handle.address().clone(), handle) {
            tracing::debug!("Replacing crossed connection to {}", old.address());
            old.close();
        }
    }
}

/// Process-wide set of live connections keyed by peer address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection unless its address is already present.
    pub fn register(&self, handle: PeerHandle) -> bool {
        let registered = self.lock().insert(handle.clone());
        if registered {
            tracing::debug!("Registered {} ({:?})", handle.address(), handle.direction());
        }
        registered
    }

    /// Register a connection we dialed, settling a crossed connection
    /// from the same peer. Returns the connection left registered for the
    /// address, which is `handle` unless an existing one was kept.
    pub fn register_dialed(&self, handle: PeerHandle, local: &PeerAddress) -> PeerHandle {
        let mut inner = self.lock();
        if let Some(existing) = inner.handles.get(handle.address()) {
            if !supersedes(local, existing, &handle) {
                return existing.clone();
            }
            inner.replace(handle.clone());
            return handle;
        }
        inner.insert(handle.clone());
        tracing::debug!("Registered {} ({:?})", handle.address(), handle.direction());
        handle
    }

    /// Check capacity and uniqueness, then register, atomically.
    ///
    /// Capacity counts every live connection, whichever side dialed. An
    /// inbound connection that wins the tie-break against our own dial to
    /// the same peer takes its slot.
    pub fn admit(&self, handle: PeerHandle, max_connections: usize, local: &PeerAddress) -> Admission {
        let mut inner = self.lock();
        if let Some(existing) = inner.handles.get(handle.address()) {
            if supersedes(local, existing, &handle) {
                inner.replace(handle);
                return Admission::Admitted;
            }
        }
        if inner.handles.len() >= max_connections {
            return Admission::AtCapacity(inner.order.clone());
        }
        if inner.insert(handle) {
            Admission::Admitted
        } else {
            Admission::Duplicate
        }
    }

    /// Remove the entry for `address` if it still belongs to connection `id`.
    pub fn unregister(&self, address: &PeerAddress, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        match inner.handles.get(address) {
            Some(handle) if handle.id() == id => {
                inner.handles.remove(address);
                inner.order.retain(|a| a != address);
                tracing::debug!("Unregistered {} (remaining: {})", address, inner.handles.len());
                true
            }
            _ => false,
        }
    }

    /// Whether a connection to `address` is live.
    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.lock().handles.contains_key(address)
    }

    /// Handle for `address`, if connected.
    pub fn get(&self, address: &PeerAddress) -> Option<PeerHandle> {
        self.lock().handles.get(address).cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    /// Check if there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connected addresses in registration order.
    pub fn snapshot(&self) -> Vec<PeerAddress> {
        self.lock().order.clone()
    }

    /// Handles of every live connection, in registration order.
    pub fn handles(&self) -> Vec<PeerHandle> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|address| inner.handles.get(address).cloned())
            .collect()
    }

    /// Ask every connection to shut down.
    ///
    /// Entries are removed by each connection as it exits.
    pub fn close_all(&self) {
        for handle in self.handles() {
            handle.close();
        }
    }
}
