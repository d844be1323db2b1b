//! Candidate tracking for rerouting after a refused connection.
//!
//! When a listener is full it answers with the peers it is connected to.
//! The dialer tries those breadth-first, folding in the peer lists of any
//! further refusals, until one attempt succeeds or nothing is left.
//!
//! Every address is handed out at most once per queue, so a refusal chain
//! that points back at itself terminates.

use std::collections::{HashSet, VecDeque};
use peersync_types::PeerAddress;

/// Breadth-first, deduplicated queue of addresses to dial.
#[derive(Debug, Clone, Default)]
pub struct ReconnectQueue {
    /// Addresses waiting to be tried, in discovery order.
    pending: VecDeque<PeerAddress>,
    /// Everything ever offered or excluded; never offered twice.
    seen: HashSet<PeerAddress>,
    /// Number of addresses handed out by `pop`.
    attempted: usize,
}

impl ReconnectQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Never hand out `address` (our own address, peers already connected).
    pub fn exclude(&mut self, address: PeerAddress) {
        self.seen.insert(address);
    }

    /// Queue `address` unless it was seen before.
    ///
    /// Returns `true` if it was queued.
    pub fn offer(&mut self, address: PeerAddress) -> bool {
        if self.seen.insert(address.clone()) {
            self.pending.push_back(address);
            true
        } else {
            false
        }
    }

    /// Queue every unseen address from a refusal, preserving order.
    ///
    /// Returns how many were queued.
    pub fn offer_all(&mut self, addresses: impl IntoIterator<Item = PeerAddress>) -> usize {
        addresses
            .into_iter()
            .filter(|address| self.offer(address.clone()))
            .count()
    }

    /// Next address to try.
    pub fn pop(&mut self) -> Option<PeerAddress> {
        let next = self.pending.pop_front()?;
        self.attempted += 1;
        Some(next)
    }

    /// Number of addresses handed out so far.
    pub fn attempted(&self) -> usize {
        self.attempted
    }
}
