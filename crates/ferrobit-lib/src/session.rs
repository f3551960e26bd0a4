use std::io;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bittorrent_peer_protocol::Bitfield;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::peer::PeerContext;
use crate::peer_pool::PeerPool;
use crate::piece::PieceProgress;
use crate::queue::WorkQueue;
use crate::scheduler::PieceScheduler;
use crate::storage::{verify_existing_pieces, FileStorage};
use crate::tracker::{Announce, EventType, TrackerClient, TrackerRequest};
use crate::util::generate_peer_id;
use crate::{Error, InfoHash, Progress, Result, SessionConfig, SessionState, TorrentMeta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    /// Pieces present once the download finished, including resumed ones
    pub pieces: usize,
    pub bytes: u64,
    /// Pieces that were already on disk before the download started
    pub resumed_pieces: usize,
    pub path: PathBuf,
}

/// Everything needed to download a single torrent into `save_dir`
#[derive(Debug)]
pub struct TorrentSession {
    meta: Arc<TorrentMeta>,
    peer_id: [u8; 20],
    output_path: PathBuf,
    config: SessionConfig,
    progress_tx: Arc<watch::Sender<Progress>>,
    bitfield_tx: Arc<watch::Sender<Bitfield>>,
    started: AtomicBool,
}

impl TorrentSession {
    pub fn new(meta: TorrentMeta, save_dir: &Path, config: SessionConfig) -> Self {
        let (progress_tx, _) = watch::channel(Progress::new(&meta));
        let (bitfield_tx, _) = watch::channel(Bitfield::new(meta.number_of_pieces()));

        TorrentSession {
            output_path: save_dir.join(&meta.name),
            meta: Arc::new(meta),
            peer_id: generate_peer_id(),
            config,
            progress_tx: Arc::new(progress_tx),
            bitfield_tx: Arc::new(bitfield_tx),
            started: AtomicBool::new(false),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.meta.info_hash
    }

    pub fn meta(&self) -> &TorrentMeta {
        &self.meta
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn progress(&self) -> Progress {
        self.progress_tx.borrow().clone()
    }

    /// Receives a new snapshot after every verified piece and every peer state change
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    /// Pieces verified so far
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield_tx.borrow().clone()
    }

    /// Returns `false` if the session was already started
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Announces to the trackers of the torrent in order, until one of them answers
    #[tracing::instrument(level = "debug", err(level = "debug"), skip(self), fields(info_hash = %self.meta.info_hash))]
    pub async fn announce(&self, event: Option<EventType>) -> Result<Announce> {
        let client = TrackerClient::new(self.config.tracker_timeout)?;
        let progress = self.progress();
        let mut request = TrackerRequest::new(
            self.meta.info_hash.0,
            self.peer_id,
            self.config.listen_port,
            progress.downloaded_bytes,
            progress.total_bytes - progress.downloaded_bytes,
        );
        if let Some(event) = event {
            request = request.with_event(event);
        }

        let mut last_error = Error::NoPeers;
        for tracker in self.meta.trackers() {
            match client.announce(&tracker, &request).await {
                Ok(announce) => return Ok(announce),
                Err(e) => {
                    tracing::warn!(%tracker, "announce failed: {}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Announces the start of the download, downloads from the returned peers and lets the
    /// tracker know once the download is complete
    pub async fn start(&self) -> Result<DownloadSummary> {
        let announce = match self.announce(Some(EventType::Started)).await {
            Ok(announce) => announce,
            Err(e) => return self.finish(Err(e)),
        };
        tracing::info!("tracker returned {} peers", announce.peers.len());

        let summary = self.download(announce.peers).await?;
        if let Err(e) = self.announce(Some(EventType::Completed)).await {
            tracing::debug!("failed to announce the completion: {}", e);
        }
        Ok(summary)
    }

    /// Downloads every missing piece from `peers` into the output file
    pub async fn download(&self, peers: Vec<SocketAddrV4>) -> Result<DownloadSummary> {
        let result = self.run_download(peers).await;
        self.finish(result)
    }

    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        let state = match &result {
            Ok(_) => SessionState::Completed,
            Err(Error::NoPeers | Error::DownloadStalled { .. }) => SessionState::Stalled,
            Err(_) => SessionState::Failed,
        };
        self.progress_tx.send_modify(|progress| progress.state = state);

        match &result {
            Ok(_) => tracing::info!(path = ?self.output_path, "download complete"),
            Err(e) => tracing::error!("download failed: {}", e),
        }
        result
    }

    #[tracing::instrument(level = "debug", err(level = "debug"), skip_all, fields(info_hash = %self.meta.info_hash))]
    async fn run_download(&self, peers: Vec<SocketAddrV4>) -> Result<DownloadSummary> {
        let (storage, present) = self.open_storage().await?;
        let resumed_pieces = present.count_ones();
        let resumed_bytes = present
            .pieces()
            .map(|index| self.meta.piece_size(index) as u64)
            .sum::<u64>();

        self.bitfield_tx.send_replace(present.clone());
        self.progress_tx.send_modify(|progress| {
            progress.state = SessionState::Downloading;
            progress.downloaded_pieces = resumed_pieces;
            progress.downloaded_bytes = resumed_bytes;
        });
        let summary = DownloadSummary {
            pieces: self.meta.number_of_pieces(),
            bytes: self.meta.total_length,
            resumed_pieces,
            path: self.output_path.clone(),
        };

        if present.is_complete() {
            tracing::info!("all pieces are already present");
            return Ok(summary);
        }
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }

        let pieces = (0..self.meta.number_of_pieces())
            .filter(|index| !present.has_piece(*index))
            .map(|index| PieceProgress::new(index as u32, self.meta.piece_size(index), self.meta.piece_hashes[index]));
        let queue = Arc::new(WorkQueue::new(pieces));
        let (results_tx, results_rx) = mpsc::channel(self.config.max_peers.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ctx = PeerContext {
            meta: self.meta.clone(),
            peer_id: self.peer_id,
            config: self.config.clone(),
            queue: queue.clone(),
            results_tx,
            events_tx,
            bitfield: self.bitfield_tx.subscribe(),
        };
        let mut pool = PeerPool::new(Arc::new(ctx));
        pool.add_peers(peers);
        tracing::debug!(
            live = pool.live(),
            missing = queue.len(),
            "started downloading"
        );

        PieceScheduler::new(
            self.meta.clone(),
            storage,
            queue,
            self.bitfield_tx.clone(),
            self.progress_tx.clone(),
            results_rx,
            events_rx,
        )
        .run(pool)
        .await?;

        Ok(summary)
    }

    /// Opens the output file and finds out which pieces it already holds
    async fn open_storage(&self) -> Result<(FileStorage, Bitfield)> {
        let mut storage = FileStorage::open(&self.output_path, self.meta.total_length)?;
        if !storage.existed() {
            return Ok((storage, Bitfield::new(self.meta.number_of_pieces())));
        }

        tracing::info!(path = ?storage.path(), "output file exists, checking its pieces");
        let meta = self.meta.clone();
        let (storage, present) = tokio::task::spawn_blocking(move || {
            let present = verify_existing_pieces(&mut storage, &meta);
            (storage, present)
        })
        .await
        .map_err(io::Error::other)?;

        Ok((storage, present?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::test_util::{
        closed_port, compact_peers, fast_config, meta_for, sample_data, spawn_seeder, spawn_tracker, SeederBehavior,
    };

    fn session(meta: TorrentMeta, dir: &Path, config: SessionConfig) -> TorrentSession {
        TorrentSession::new(meta, dir, config)
    }

    #[tokio::test]
    async fn downloads_from_several_seeders() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let data = sample_data(20_000);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (first, _) = spawn_seeder(&meta, data.clone(), SeederBehavior::Honest).await;
        let (second, _) = spawn_seeder(&meta, data.clone(), SeederBehavior::Honest).await;
        let session = session(meta, dir.path(), fast_config());

        let summary = session.download(vec![first, second]).await.expect("download failed");

        assert_eq!(summary.pieces, 2);
        assert_eq!(summary.bytes, 20_000);
        assert_eq!(summary.resumed_pieces, 0);
        assert_eq!(std::fs::read(&summary.path).expect("failed to read the output"), data);
        assert!(session.bitfield().is_complete());

        let progress = session.progress();
        assert_eq!(progress.state, SessionState::Completed);
        assert_eq!(progress.downloaded_pieces, 2);
        assert_eq!(progress.downloaded_bytes, 20_000);
        assert_eq!(progress.peers.len(), 2);
        assert_eq!(progress.live_peers(), 0);
    }

    #[tokio::test]
    async fn foreign_peer_leads_to_a_stall() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let data = sample_data(100);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (peer, connections) = spawn_seeder(&meta, data, SeederBehavior::WrongInfoHash).await;
        let session = session(meta, dir.path(), fast_config());

        let result = session.download(vec![peer]).await;

        assert!(matches!(result, Err(Error::DownloadStalled { missing: 1 })));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(session.progress().state, SessionState::Stalled);
        assert!(!session.bitfield().has_piece(0));
    }

    #[tokio::test]
    async fn corrupt_peer_alone_leads_to_a_stall() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let data = sample_data(100);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (peer, connections) = spawn_seeder(&meta, data, SeederBehavior::CorruptBlocks).await;
        let session = session(meta, dir.path(), fast_config());

        let result = session.download(vec![peer]).await;

        assert!(matches!(result, Err(Error::DownloadStalled { missing: 1 })));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(session.progress().state, SessionState::Stalled);
        assert_eq!(session.progress().downloaded_pieces, 0);
        let written = std::fs::read(session.output_path()).expect("failed to read the output");
        assert!(written.iter().all(|byte| *byte == 0));
    }

    #[tokio::test]
    async fn corrupt_peer_doesnt_stop_an_honest_one() {
        for max_rejected_pieces in [2, 5] {
            let dir = tempfile::tempdir().expect("failed to create a temp dir");
            let data = sample_data(8 * 16384);
            let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
            let (corrupt, _) = spawn_seeder(&meta, data.clone(), SeederBehavior::CorruptBlocks).await;
            let (honest, _) = spawn_seeder(&meta, data.clone(), SeederBehavior::Honest).await;
            let config = SessionConfig {
                max_rejected_pieces,
                ..fast_config()
            };
            let session = session(meta, dir.path(), config);

            let summary = session
                .download(vec![corrupt, honest])
                .await
                .expect("download failed");

            assert_eq!(std::fs::read(&summary.path).expect("failed to read the output"), data);
            assert_eq!(session.progress().state, SessionState::Completed);
            assert_eq!(session.progress().downloaded_pieces, 8);
        }
    }

    #[tokio::test]
    async fn unreachable_peers_lead_to_a_stall() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let meta = meta_for(&sample_data(100), 16384, "http://127.0.0.1:1/announce");
        let config = SessionConfig {
            connect_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            ..fast_config()
        };
        let session = session(meta, dir.path(), config);

        let result = session.download(vec![closed_port().await]).await;

        assert!(matches!(result, Err(Error::DownloadStalled { .. })));
        assert_eq!(session.progress().state, SessionState::Stalled);
    }

    #[tokio::test]
    async fn partial_file_is_resumed() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let data = sample_data(40_000);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let mut partial = data.clone();
        partial[16384..].iter_mut().for_each(|byte| *byte = 0);
        std::fs::write(dir.path().join(&meta.name), &partial).expect("failed to write a partial file");

        let (peer, _) = spawn_seeder(&meta, data.clone(), SeederBehavior::Honest).await;
        let session = session(meta, dir.path(), fast_config());
        let summary = session.download(vec![peer]).await.expect("download failed");

        assert_eq!(summary.resumed_pieces, 1);
        assert_eq!(std::fs::read(&summary.path).expect("failed to read the output"), data);
        assert_eq!(session.progress().downloaded_bytes, 40_000);
    }

    #[tokio::test]
    async fn complete_file_needs_no_peers() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let data = sample_data(40_000);
        let meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        std::fs::write(dir.path().join(&meta.name), &data).expect("failed to write the file");

        let session = session(meta, dir.path(), fast_config());
        let summary = session.download(Vec::new()).await.expect("download failed");

        assert_eq!(summary.resumed_pieces, 3);
        assert_eq!(session.progress().state, SessionState::Completed);
    }

    #[tokio::test]
    async fn no_peers_and_nothing_on_disk() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let meta = meta_for(&sample_data(100), 16384, "http://127.0.0.1:1/announce");
        let session = session(meta, dir.path(), fast_config());

        assert!(matches!(session.download(Vec::new()).await, Err(Error::NoPeers)));
        assert_eq!(session.progress().state, SessionState::Stalled);
    }

    #[tokio::test]
    async fn start_gets_peers_from_the_tracker() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let data = sample_data(20_000);
        let seeder_meta = meta_for(&data, 16384, "http://127.0.0.1:1/announce");
        let (peer, _) = spawn_seeder(&seeder_meta, data.clone(), SeederBehavior::Honest).await;

        let peers = compact_peers(&[peer]);
        let mut body = format!("d8:intervali60e5:peers{}:", peers.len()).into_bytes();
        body.extend_from_slice(&peers);
        body.push(b'e');
        let (announce, requests) = spawn_tracker(body).await;

        let session = session(meta_for(&data, 16384, &announce), dir.path(), fast_config());
        let summary = session.start().await.expect("download failed");

        assert_eq!(std::fs::read(&summary.path).expect("failed to read the output"), data);
        let requests = requests.lock().expect("lock poisoned").clone();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("event=started"));
        assert!(requests[0].contains("left=20000"));
        assert!(requests[1].contains("event=completed"));
        assert!(requests[1].contains("left=0"));
    }
}
