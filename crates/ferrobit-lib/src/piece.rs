use std::net::SocketAddrV4;

use bittorrent_peer_protocol::BlockRequest;
use sha1::{Digest, Sha1};

use crate::PeerError;

pub fn calculate_piece_hash(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// In-flight state of a single piece.
///
/// Owned by exactly one party at a time: the work queue, a peer connection or the scheduler.
/// The buffer is only allocated once the first block is requested.
#[derive(Debug)]
pub struct PieceProgress {
    pub index: u32,
    pub length: usize,
    pub hash: [u8; 20],
    buffer: Vec<u8>,
    /// Size of every block but the last, fixed by the first request
    block_size: usize,
    /// Which blocks have arrived, indexed by `begin / block_size`
    received: Vec<bool>,
    downloaded: usize,
    requested: usize,
    backlog: usize,
    /// Failed hash verifications so far
    attempts: usize,
    /// Peers that delivered this piece with a wrong hash
    rejected_by: Vec<SocketAddrV4>,
}

impl PieceProgress {
    pub fn new(index: u32, length: usize, hash: [u8; 20]) -> Self {
        PieceProgress {
            index,
            length,
            hash,
            buffer: Vec::new(),
            block_size: 0,
            received: Vec::new(),
            downloaded: 0,
            requested: 0,
            backlog: 0,
            attempts: 0,
            rejected_by: Vec::new(),
        }
    }

    /// The next block to ask for, or `None` if the whole piece was already requested
    pub fn next_request(&mut self, block_size: u32) -> Option<BlockRequest> {
        if self.requested >= self.length {
            return None;
        }
        if self.buffer.len() != self.length {
            let block_size = (block_size as usize).max(1);
            self.buffer = vec![0; self.length];
            self.block_size = block_size;
            self.received = vec![false; self.length.div_ceil(block_size)];
        }

        let length = (self.length - self.requested).min(self.block_size);
        let request = BlockRequest {
            index: self.index,
            begin: self.requested as u32,
            length: length as u32,
        };
        self.requested += length;
        self.backlog += 1;
        Some(request)
    }

    /// Copies a received block into the piece buffer. Returns `false` for a block that already
    /// arrived, which is left as it is.
    pub fn write_block(&mut self, begin: u32, data: &[u8]) -> Result<bool, PeerError> {
        let bad_block = PeerError::BadBlock {
            index: self.index,
            begin,
            length: data.len(),
        };
        let start = begin as usize;
        if self.block_size == 0 || start % self.block_size != 0 || start >= self.requested {
            return Err(bad_block);
        }
        let end = start + self.block_size.min(self.length - start);
        if data.len() != end - start {
            return Err(bad_block);
        }

        let block = start / self.block_size;
        if self.received[block] {
            return Ok(false);
        }
        self.received[block] = true;
        self.buffer[start..end].copy_from_slice(data);
        self.downloaded += data.len();
        self.backlog = self.backlog.saturating_sub(1);
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.length
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn matches_hash(&self) -> bool {
        self.buffer.len() == self.length && calculate_piece_hash(&self.buffer) == self.hash
    }

    /// Records a failed verification of the data `peer` sent and returns the total number of
    /// failures
    pub fn record_failure(&mut self, peer: SocketAddrV4) -> usize {
        self.attempts += 1;
        if !self.rejected_by.contains(&peer) {
            self.rejected_by.push(peer);
        }
        self.attempts
    }

    /// Whether `peer` already sent this piece with a wrong hash
    pub fn was_rejected_from(&self, peer: SocketAddrV4) -> bool {
        self.rejected_by.contains(&peer)
    }

    /// Drops all downloaded data, so the piece can be requested again from scratch
    pub fn reset(&mut self) {
        self.buffer = Vec::new();
        self.block_size = 0;
        self.received = Vec::new();
        self.downloaded = 0;
        self.requested = 0;
        self.backlog = 0;
    }
}
