use std::net::SocketAddrV4;

use serde::Serialize;

use crate::peer::{PeerEvent, PeerState};
use crate::TorrentMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Downloading,
    Completed,
    /// Pieces are missing and no peer is left to download them from
    Stalled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub addr: SocketAddrV4,
    pub state: PeerState,
}

/// Point-in-time view of a torrent session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub state: SessionState,
    pub downloaded_pieces: usize,
    pub total_pieces: usize,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub peers: Vec<PeerSnapshot>,
}

impl Progress {
    pub fn new(meta: &TorrentMeta) -> Self {
        Progress {
            state: SessionState::Starting,
            downloaded_pieces: 0,
            total_pieces: meta.number_of_pieces(),
            downloaded_bytes: 0,
            total_bytes: meta.total_length,
            peers: Vec::new(),
        }
    }

    /// Whether the session reached a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SessionState::Completed | SessionState::Stalled | SessionState::Failed
        )
    }

    pub fn live_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.state != PeerState::Disconnected)
            .count()
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub(crate) fn record_piece(&mut self, length: usize) {
        self.downloaded_pieces += 1;
        self.downloaded_bytes += length as u64;
    }

    pub(crate) fn apply_peer_event(&mut self, event: PeerEvent) {
        match self.peers.iter_mut().find(|peer| peer.addr == event.addr) {
            Some(peer) => peer.state = event.state,
            None => self.peers.push(PeerSnapshot {
                addr: event.addr,
                state: event.state,
            }),
        }
    }
}
