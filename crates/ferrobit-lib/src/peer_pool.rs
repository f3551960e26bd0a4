use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::peer::{handle_peer, PeerContext};
use crate::PeerError;

/// Runs peer connections, at most `max_peers` of them at a time.
/// Addresses over the limit wait in a queue until a running connection exits.
#[derive(Debug)]
pub struct PeerPool {
    ctx: Arc<PeerContext>,
    tasks: JoinSet<(SocketAddrV4, Result<(), PeerError>)>,
    pending: VecDeque<SocketAddrV4>,
    max_peers: usize,
}

impl PeerPool {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        let max_peers = ctx.config.max_peers.max(1);
        PeerPool {
            ctx,
            tasks: JoinSet::new(),
            pending: VecDeque::new(),
            max_peers,
        }
    }

    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = SocketAddrV4>) {
        for peer in peers {
            if !self.pending.contains(&peer) {
                self.pending.push_back(peer);
            }
        }
        self.refill();
    }

    fn refill(&mut self) {
        while self.tasks.len() < self.max_peers {
            let Some(peer_addr) = self.pending.pop_front() else {
                break;
            };
            tracing::debug!(%peer_addr, "spawning a peer connection");
            self.tasks.spawn(handle_peer(peer_addr, self.ctx.clone()));
        }
    }

    /// Number of connections currently running
    pub fn live(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for the next connection to exit and starts a pending one in its place.
    /// Returns `false` right away if no connection is running and none is waiting.
    pub async fn join_next(&mut self) -> bool {
        let Some(result) = self.tasks.join_next().await else {
            return false;
        };
        match result {
            Ok((peer_addr, Ok(()))) => tracing::debug!(%peer_addr, "peer connection finished"),
            Ok((peer_addr, Err(e))) => tracing::debug!(%peer_addr, "peer connection failed: {}", e),
            Err(e) if e.is_panic() => tracing::error!("a peer connection panicked: {}", e),
            Err(_) => {}
        }

        self.refill();
        true
    }

    /// Aborts every running connection and waits for them to exit
    pub async fn shutdown(&mut self) {
        self.pending.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        tracing::debug!("all peer connections were shut down");
    }
}
