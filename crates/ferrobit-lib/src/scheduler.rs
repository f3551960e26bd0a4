use std::sync::Arc;

use bittorrent_peer_protocol::Bitfield;
use tokio::sync::{mpsc, watch};

use crate::peer::{PeerEvent, PieceResult, Verdict};
use crate::peer_pool::PeerPool;
use crate::queue::WorkQueue;
use crate::storage::Storage;
use crate::{Error, Progress, Result, TorrentMeta};

/// The single consumer of finished pieces: verifies them, writes them to storage and publishes
/// the new bitfield and progress. Nothing else writes to the storage.
///
/// A rejected piece goes back to the queue, marked so that the peer which sent it never gets it
/// again. The download only gives up once no connection is left.
pub struct PieceScheduler<S> {
    meta: Arc<TorrentMeta>,
    storage: S,
    queue: Arc<WorkQueue>,
    bitfield_tx: Arc<watch::Sender<Bitfield>>,
    progress_tx: Arc<watch::Sender<Progress>>,
    results_rx: mpsc::Receiver<PieceResult>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    missing: usize,
}

impl<S: Storage> PieceScheduler<S> {
    pub fn new(
        meta: Arc<TorrentMeta>,
        storage: S,
        queue: Arc<WorkQueue>,
        bitfield_tx: Arc<watch::Sender<Bitfield>>,
        progress_tx: Arc<watch::Sender<Progress>>,
        results_rx: mpsc::Receiver<PieceResult>,
        events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Self {
        let missing = meta.number_of_pieces() - bitfield_tx.borrow().count_ones();
        PieceScheduler {
            meta,
            storage,
            queue,
            bitfield_tx,
            progress_tx,
            results_rx,
            events_rx,
            missing,
        }
    }

    /// Runs until every piece is verified and written, or the download can't go on.
    /// All peer connections are shut down before returning.
    #[tracing::instrument(level = "debug", err(level = "debug"), skip_all, fields(info_hash = %self.meta.info_hash))]
    pub async fn run(mut self, mut pool: PeerPool) -> Result<()> {
        let result = self.drive(&mut pool).await;

        self.queue.close();
        pool.shutdown().await;
        while let Ok(event) = self.events_rx.try_recv() {
            self.progress_tx.send_modify(|progress| progress.apply_peer_event(event));
        }

        result
    }

    async fn drive(&mut self, pool: &mut PeerPool) -> Result<()> {
        while self.missing > 0 {
            tokio::select! {
                biased;
                Some(result) = self.results_rx.recv() => self.handle_result(result)?,
                Some(event) = self.events_rx.recv() => {
                    self.progress_tx.send_modify(|progress| progress.apply_peer_event(event));
                }
                alive = pool.join_next() => {
                    if !alive {
                        return Err(Error::DownloadStalled { missing: self.missing });
                    }
                }
            }
        }

        tracing::debug!("all pieces were downloaded");
        Ok(())
    }

    fn handle_result(&mut self, result: PieceResult) -> Result<()> {
        let PieceResult {
            peer,
            mut piece,
            verdict_tx,
        } = result;
        let index = piece.index;

        if piece.matches_hash() {
            self.storage
                .write_all(self.meta.piece_offset(index as usize), piece.data())?;
            self.bitfield_tx.send_modify(|bitfield| bitfield.set_piece(index as usize));
            self.progress_tx.send_modify(|progress| progress.record_piece(piece.length));
            self.missing -= 1;
            tracing::debug!(index, %peer, missing = self.missing, "piece verified and written");

            // The connection may be gone already
            let _ = verdict_tx.send(Verdict::Verified);
            return Ok(());
        }

        let attempts = piece.record_failure(peer);
        tracing::warn!(index, %peer, attempts, "piece failed hash verification");
        let _ = verdict_tx.send(Verdict::Rejected);

        piece.reset();
        self.queue.push(piece);
        Ok(())
    }
}
