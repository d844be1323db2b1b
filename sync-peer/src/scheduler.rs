//! Periodic synchronization.
//!
//! Every `sync_interval_secs` the node asks its event source what changed
//! and broadcasts the resulting requests to every connected peer. Freshly
//! connected peers get the full current state once, after a short delay.

use crate::error::EventSourceError;
use crate::node::Node;
use crate::registry::PeerHandle;
use peersync_core::OutgoingQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Run [`run_sync_cycle`] on the configured interval until shutdown.
pub fn spawn_sync_task(node: Arc<Node>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(node.config().sync.sync_interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = node.shutdown_token().cancelled() => break,
                _ = ticker.tick() => {}
            }
            match run_sync_cycle(&node).await {
                Ok(0) => tracing::trace!("Nothing to synchronize"),
                Ok(sent) => tracing::debug!("Sync cycle queued {} commands", sent),
                Err(e) => tracing::warn!("Sync cycle failed: {}", e),
            }
        }
        tracing::debug!("Sync task stopped");
    })
}

/// One synchronization cycle: gather events, translate, broadcast.
///
/// Holds the node's outgoing queue for the whole cycle so two cycles never
/// interleave their commands. Returns the number of commands broadcast.
pub async fn run_sync_cycle(node: &Node) -> Result<usize, EventSourceError> {
    let mut outgoing = node.outgoing().lock().await;
    let events = node.events().generate_sync_events().await?;
    let skipped = outgoing.extend_events(&events);
    if skipped > 0 {
        tracing::warn!("Skipped {} file events without metadata", skipped);
    }

    let commands = outgoing.drain();
    if commands.is_empty() || node.registry().is_empty() {
        return Ok(0);
    }
    let peers = node.broadcast(&commands).await;
    tracing::debug!("Broadcast {} commands to {} peers", commands.len(), peers);
    Ok(commands.len())
}

/// Send `handle` the node's full current state after `delay`.
///
/// Does nothing if the connection closes first.
pub fn schedule_initial_push(node: Arc<Node>, handle: PeerHandle, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = handle.closer().cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        match push_current_state(&node, &handle).await {
            Ok(sent) => tracing::debug!("Pushed {} commands to {}", sent, handle.address()),
            Err(e) => tracing::warn!("Initial push to {} failed: {}", handle.address(), e),
        }
    })
}

/// Queue the full current state on one connection.
pub async fn push_current_state(node: &Node, handle: &PeerHandle) -> Result<usize, EventSourceError> {
    let state = node.events().current_state().await?;
    let mut queue = OutgoingQueue::new();
    queue.extend_events(&state);

    let mut sent = 0;
    for command in queue.drain() {
        if !handle.send(command).await {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}
