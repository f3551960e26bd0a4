use std::net::SocketAddrV4;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bittorrent_peer_protocol::{BittorrentP2pMessage, Bitfield, Block, Encode, Handshake};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::buffer::ReadBuf;
use crate::piece::PieceProgress;
use crate::queue::WorkQueue;
use crate::torrent_meta::{InfoHash, TorrentMeta};
use crate::{PeerError, SessionConfig, WithTimeout};

/// Lifecycle of a single peer connection, as seen by the rest of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Choked,
    Unchoked,
    Requesting,
    Downloading,
    /// The session has every piece, nothing is left to request
    Seeding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEvent {
    pub addr: SocketAddrV4,
    pub state: PeerState,
}

/// Outcome of the hash check of a piece a connection handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Rejected,
}

/// A fully downloaded piece waiting for verification
#[derive(Debug)]
pub struct PieceResult {
    pub peer: SocketAddrV4,
    pub piece: PieceProgress,
    pub verdict_tx: oneshot::Sender<Verdict>,
}

/// Everything a connection needs from its session
#[derive(Debug)]
pub struct PeerContext {
    pub meta: Arc<TorrentMeta>,
    pub peer_id: [u8; 20],
    pub config: SessionConfig,
    pub queue: Arc<WorkQueue>,
    pub results_tx: mpsc::Sender<PieceResult>,
    pub events_tx: mpsc::UnboundedSender<PeerEvent>,
    /// Pieces the session has verified so far
    pub bitfield: watch::Receiver<Bitfield>,
}

/// Publishes state changes of a connection and reports it as disconnected when dropped
struct StateReporter {
    addr: SocketAddrV4,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    current: PeerState,
}

impl StateReporter {
    fn new(addr: SocketAddrV4, events_tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        StateReporter {
            addr,
            events_tx,
            current: PeerState::Disconnected,
        }
    }

    fn set(&mut self, state: PeerState) {
        if self.current != state {
            tracing::trace!(from = ?self.current, to = ?state, "peer state changed");
            self.current = state;
            // The receiver is gone only when the session is over
            let _ = self.events_tx.send(PeerEvent { addr: self.addr, state });
        }
    }
}

impl Drop for StateReporter {
    fn drop(&mut self) {
        self.set(PeerState::Disconnected);
    }
}

/// A piece taken from the work queue. Goes back to the queue when dropped, unless it was handed
/// over with [`PieceLease::into_inner`].
struct PieceLease {
    piece: Option<PieceProgress>,
    queue: Arc<WorkQueue>,
}

impl PieceLease {
    fn new(piece: PieceProgress, queue: Arc<WorkQueue>) -> Self {
        PieceLease {
            piece: Some(piece),
            queue,
        }
    }

    fn into_inner(mut self) -> Option<PieceProgress> {
        self.piece.take()
    }
}

impl Deref for PieceLease {
    type Target = PieceProgress;

    fn deref(&self) -> &Self::Target {
        match self.piece {
            Some(ref piece) => piece,
            None => unreachable!("a lease is only emptied by into_inner"),
        }
    }
}

impl DerefMut for PieceLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.piece {
            Some(ref mut piece) => piece,
            None => unreachable!("a lease is only emptied by into_inner"),
        }
    }
}

impl Drop for PieceLease {
    fn drop(&mut self) {
        if let Some(mut piece) = self.piece.take() {
            tracing::debug!(index = piece.index, "returning an unfinished piece to the queue");
            piece.reset();
            self.queue.push(piece);
        }
    }
}

/// Drives a single peer from the first connection attempt until it has nothing more to offer.
///
/// Transport failures are retried up to `connect_attempts` times in total. Protocol violations
/// end the connection right away.
#[tracing::instrument(level = "debug", skip_all, fields(%peer_addr))]
pub async fn handle_peer(peer_addr: SocketAddrV4, ctx: Arc<PeerContext>) -> (SocketAddrV4, Result<(), PeerError>) {
    let mut reporter = StateReporter::new(peer_addr, ctx.events_tx.clone());
    let mut attempt = 0;

    let result = loop {
        attempt += 1;
        match connect_and_download(peer_addr, &ctx, &mut reporter).await {
            Err(e) if e.is_retryable() && attempt < ctx.config.connect_attempts && !ctx.queue.is_closed() => {
                tracing::debug!(attempt, "connection attempt failed, retrying: {}", e);
                reporter.set(PeerState::Disconnected);
                tokio::time::sleep(ctx.config.retry_backoff * attempt as u32).await;
            }
            result => break result,
        }
    };

    (peer_addr, result)
}

async fn connect_and_download(
    peer_addr: SocketAddrV4,
    ctx: &PeerContext,
    reporter: &mut StateReporter,
) -> Result<(), PeerError> {
    reporter.set(PeerState::Connecting);
    let stream = TcpStream::connect(peer_addr)
        .with_timeout::<PeerError>("peer connect", ctx.config.connect_timeout)
        .await?;
    tracing::debug!("connected to a peer");

    let mut connection = PeerConnection {
        addr: peer_addr,
        ctx,
        reporter,
        stream,
        read_buf: ReadBuf::new(),
        output: Vec::with_capacity(ctx.config.block_size as usize),
        remote: Bitfield::new(ctx.meta.number_of_pieces()),
        choked: true,
        rejected: 0,
    };
    connection.handshake().await?;
    connection.exchange_bitfields().await?;
    connection.download().await
}

struct PeerConnection<'a> {
    addr: SocketAddrV4,
    ctx: &'a PeerContext,
    reporter: &'a mut StateReporter,
    stream: TcpStream,
    read_buf: ReadBuf,
    /// Encoded messages waiting to be written
    output: Vec<u8>,
    /// Pieces the remote peer has
    remote: Bitfield,
    /// Whether the remote peer chokes us
    choked: bool,
    /// Pieces from this peer that failed verification
    rejected: usize,
}

impl<'a> PeerConnection<'a> {
    async fn flush(&mut self) -> Result<(), PeerError> {
        if !self.output.is_empty() {
            self.stream
                .write_all(&self.output)
                .with_timeout::<PeerError>("write to peer", self.ctx.config.io_timeout)
                .await?;
            self.output.clear();
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<BittorrentP2pMessage, PeerError> {
        self.read_buf
            .read_message(&mut self.stream)
            .with_timeout::<PeerError>("read from peer", self.ctx.config.io_timeout)
            .await
    }

    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all)]
    async fn handshake(&mut self) -> Result<(), PeerError> {
        self.reporter.set(PeerState::Handshaking);
        Handshake::new(self.ctx.meta.info_hash.0, self.ctx.peer_id)
            .encode(&mut self.output)
            .await?;
        self.flush().await?;

        let handshake = self
            .read_buf
            .read_handshake(&mut self.stream)
            .with_timeout::<PeerError>("read handshake", self.ctx.config.io_timeout)
            .await?;
        if handshake.info_hash != self.ctx.meta.info_hash.0 {
            return Err(PeerError::InfoHashMismatch(InfoHash(handshake.info_hash)));
        }

        tracing::trace!(remote_peer_id = %String::from_utf8_lossy(&handshake.peer_id), "handshake done");
        Ok(())
    }

    /// Waits for the peer's bitfield, answers with ours and asks to be unchoked
    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all)]
    async fn exchange_bitfields(&mut self) -> Result<(), PeerError> {
        self.reporter.set(PeerState::AwaitingBitfield);
        let remote = loop {
            match self.read().await? {
                BittorrentP2pMessage::KeepAlive => continue,
                BittorrentP2pMessage::Bitfield(bitfield) => break bitfield,
                other => return Err(PeerError::UnexpectedFirstMessage(other.message_id())),
            }
        };
        self.remote = remote.with_piece_count(self.ctx.meta.number_of_pieces());
        tracing::debug!(pieces = self.remote.count_ones(), "received peer's bitfield");

        let ours = self.ctx.bitfield.borrow().clone();
        BittorrentP2pMessage::Bitfield(ours).encode(&mut self.output).await?;
        BittorrentP2pMessage::Unchoke.encode(&mut self.output).await?;
        BittorrentP2pMessage::Interested.encode(&mut self.output).await?;
        self.flush().await?;

        self.reporter.set(PeerState::Choked);
        Ok(())
    }

    /// Downloads pieces one by one until the peer has nothing we need
    async fn download(&mut self) -> Result<(), PeerError> {
        while let Some(piece) = self.next_piece().await? {
            let mut lease = PieceLease::new(piece, self.ctx.queue.clone());
            self.download_piece(&mut lease).await?;

            let Some(piece) = lease.into_inner() else {
                continue;
            };
            let index = piece.index;
            let (verdict_tx, verdict_rx) = oneshot::channel();
            let result = PieceResult {
                peer: self.addr,
                piece,
                verdict_tx,
            };
            if self.ctx.results_tx.send(result).await.is_err() {
                tracing::debug!("scheduler is gone, closing the connection");
                return Ok(());
            }

            match verdict_rx.await {
                Ok(Verdict::Verified) => {
                    BittorrentP2pMessage::Have(index).encode(&mut self.output).await?;
                    self.flush().await?;
                }
                Ok(Verdict::Rejected) => {
                    self.rejected += 1;
                    if self.rejected >= self.ctx.config.max_rejected_pieces {
                        return Err(PeerError::TooManyRejectedPieces(self.rejected));
                    }
                    tracing::debug!(index, "piece was rejected, moving on to another one");
                }
                Err(_) => return Ok(()),
            }
        }

        Ok(())
    }

    /// Takes the next piece this peer has from the work queue, while still handling whatever
    /// the peer sends. Pieces this peer already sent corrupted are skipped. Gives up after
    /// `io_timeout` without a matching piece.
    async fn next_piece(&mut self) -> Result<Option<PieceProgress>, PeerError> {
        let idle = tokio::time::sleep(self.ctx.config.io_timeout);
        tokio::pin!(idle);

        loop {
            let (addr, remote) = (self.addr, &self.remote);
            let wanted = |piece: &PieceProgress| {
                remote.has_piece(piece.index as usize) && !piece.was_rejected_from(addr)
            };
            tokio::select! {
                piece = self.ctx.queue.next_matching(wanted) => {
                    if piece.is_none() && self.ctx.bitfield.borrow().is_complete() {
                        self.reporter.set(PeerState::Seeding);
                    }
                    return Ok(piece);
                }
                message = self.read_buf.read_message(&mut self.stream) => {
                    self.handle_message(message?, None)?;
                }
                _ = &mut idle => {
                    tracing::debug!("peer has no pieces we need, closing the connection");
                    return Ok(None);
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all, fields(index = piece.index))]
    async fn download_piece(&mut self, piece: &mut PieceLease) -> Result<(), PeerError> {
        while !piece.is_complete() {
            if !self.choked {
                let mut sent = false;
                while piece.backlog() < self.ctx.config.max_backlog {
                    let Some(request) = piece.next_request(self.ctx.config.block_size) else {
                        break;
                    };
                    BittorrentP2pMessage::Request(request).encode(&mut self.output).await?;
                    sent = true;
                }
                if sent {
                    self.reporter.set(PeerState::Requesting);
                    self.flush().await?;
                }
            }

            let message = self.read().await?;
            self.handle_message(message, Some(&mut **piece))?;
        }

        Ok(())
    }

    fn handle_message(
        &mut self,
        message: BittorrentP2pMessage,
        piece: Option<&mut PieceProgress>,
    ) -> Result<(), PeerError> {
        use BittorrentP2pMessage::*;
        tracing::trace!(message_id = ?message.message_id(), "handling a message");

        match message {
            Choke => {
                self.choked = true;
                self.reporter.set(PeerState::Choked);
                // The peer drops all pending requests
                if let Some(piece) = piece {
                    piece.reset();
                }
            }
            Unchoke => {
                self.choked = false;
                self.reporter.set(PeerState::Unchoked);
            }
            Have(index) => {
                if index as usize >= self.ctx.meta.number_of_pieces() {
                    return Err(PeerError::PieceOutOfRange(index));
                }
                self.remote.set_piece(index as usize);
            }
            Piece(Block { index, begin, data }) => match piece {
                Some(piece) if piece.index == index => match piece.write_block(begin, &data) {
                    Ok(true) => self.reporter.set(PeerState::Downloading),
                    Ok(false) => tracing::trace!(index, begin, "dropping a repeated block"),
                    Err(e) => tracing::debug!("dropping a block: {}", e),
                },
                _ => tracing::trace!(index, begin, "dropping a block of a piece we don't download"),
            },
            Bitfield(_) => tracing::debug!("ignoring a repeated bitfield"),
            Request(request) => tracing::trace!(?request, "not serving block requests"),
            Cancel(request) => tracing::trace!(?request, "received a Cancel message from peer"),
            Port(port) => tracing::trace!(port, "received a Port message"),
            KeepAlive | Interested | NotInterested => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{
        closed_port, fast_config, meta_for, peer_harness as harness, sample_data, spawn_seeder, SeederBehavior,
    };

    #[tokio::test]
    async fn downloads_pieces_and_waits_for_verdicts() {
        let data = sample_data(20_000);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (addr, _) = spawn_seeder(&meta, data.clone(), SeederBehavior::Honest).await;
        let mut harness = harness(meta, fast_config());

        let peer = tokio::spawn(handle_peer(addr, harness.ctx.clone()));

        let mut received = Vec::new();
        for _ in 0..2 {
            let result = harness.results_rx.recv().await.expect("a piece result");
            assert!(result.piece.matches_hash());
            received.push(result.piece.index);
            result
                .verdict_tx
                .send(Verdict::Verified)
                .expect("connection should wait for the verdict");
        }
        received.sort();
        assert_eq!(received, vec![0, 1]);
        assert!(harness.ctx.queue.is_empty());

        harness.ctx.queue.close();
        let (peer_addr, result) = peer.await.expect("peer task panicked");
        assert_eq!(peer_addr, addr);
        assert!(result.is_ok());

        let mut states = Vec::new();
        while let Ok(event) = harness.events_rx.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            &states[..4],
            &[
                PeerState::Connecting,
                PeerState::Handshaking,
                PeerState::AwaitingBitfield,
                PeerState::Choked
            ]
        );
        assert!(states.contains(&PeerState::Downloading));
        assert_eq!(states.last(), Some(&PeerState::Disconnected));
    }

    #[tokio::test]
    async fn rejected_piece_is_not_taken_again_by_its_sender() {
        let data = sample_data(100);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (addr, _) = spawn_seeder(&meta, data, SeederBehavior::CorruptBlocks).await;
        let mut harness = harness(meta, fast_config());

        let peer = tokio::spawn(handle_peer(addr, harness.ctx.clone()));

        let PieceResult {
            peer: sender,
            mut piece,
            verdict_tx,
        } = harness.results_rx.recv().await.expect("a piece result");
        assert_eq!(sender, addr);
        assert!(!piece.matches_hash());
        piece.record_failure(sender);
        piece.reset();
        harness.ctx.queue.push(piece);
        verdict_tx.send(Verdict::Rejected).expect("verdict");

        // The connection idles out instead of downloading the same piece again
        let (_, outcome) = peer.await.expect("peer task panicked");
        assert!(outcome.is_ok());
        assert_eq!(harness.ctx.queue.len(), 1);
        assert!(harness.results_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn too_many_rejected_pieces_close_the_connection() {
        let data = sample_data(40_000);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (addr, connections) = spawn_seeder(&meta, data, SeederBehavior::CorruptBlocks).await;
        let config = SessionConfig {
            max_rejected_pieces: 2,
            ..fast_config()
        };
        let mut harness = harness(meta, config);

        let peer = tokio::spawn(handle_peer(addr, harness.ctx.clone()));
        for _ in 0..2 {
            let result = harness.results_rx.recv().await.expect("a piece result");
            result.verdict_tx.send(Verdict::Rejected).expect("verdict");
        }

        let (_, outcome) = peer.await.expect("peer task panicked");
        assert!(matches!(outcome, Err(PeerError::TooManyRejectedPieces(2))));
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(harness.ctx.queue.len(), 1);
    }

    #[tokio::test]
    async fn info_hash_mismatch_is_not_retried() {
        let data = sample_data(100);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (addr, connections) = spawn_seeder(&meta, data, SeederBehavior::WrongInfoHash).await;
        let harness = harness(meta, fast_config());

        let (_, result) = handle_peer(addr, harness.ctx.clone()).await;

        assert!(matches!(result, Err(PeerError::InfoHashMismatch(InfoHash([0xee, ..])))));
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(harness.ctx.queue.len(), 1);
    }

    #[tokio::test]
    async fn refused_connections_are_retried_then_abandoned() {
        let meta = meta_for(&sample_data(100), 16384, "http://127.0.0.1:1/announce");
        let config = SessionConfig {
            connect_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            ..fast_config()
        };
        let mut harness = harness(meta, config);
        let addr = closed_port().await;

        let (_, result) = handle_peer(addr, harness.ctx.clone()).await;
        assert!(matches!(result, Err(PeerError::Transport(_))));

        let mut connecting = 0;
        while let Ok(event) = harness.events_rx.try_recv() {
            if event.state == PeerState::Connecting {
                connecting += 1;
            }
        }
        assert_eq!(connecting, 3);
    }

    #[test]
    fn dropped_lease_returns_the_piece() {
        let queue = Arc::new(WorkQueue::new([]));
        let mut piece = PieceProgress::new(7, 10, [0; 20]);
        piece.next_request(16384);

        drop(PieceLease::new(piece, queue.clone()));
        assert_eq!(queue.len(), 1);

        let lease = PieceLease::new(PieceProgress::new(8, 10, [0; 20]), queue.clone());
        assert!(lease.into_inner().is_some());
        assert_eq!(queue.len(), 1);
    }
}
