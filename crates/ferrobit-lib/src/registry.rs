use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{DownloadSummary, Error, InfoHash, Progress, Result, SessionConfig, TorrentMeta, TorrentSession};

/// What is known about a registered torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentRecord {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_length: u64,
    pub piece_length: usize,
    pub pieces: usize,
    pub trackers: Vec<String>,
    pub output_path: PathBuf,
}

impl TorrentRecord {
    fn new(session: &TorrentSession) -> Self {
        let meta = session.meta();
        TorrentRecord {
            info_hash: meta.info_hash,
            name: meta.name.clone(),
            total_length: meta.total_length,
            piece_length: meta.piece_length,
            pieces: meta.number_of_pieces(),
            trackers: meta.trackers(),
            output_path: session.output_path().to_path_buf(),
        }
    }
}

/// Torrent sessions of a client, by info hash
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<InfoHash, Arc<TorrentSession>>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Creates a session for `meta` that saves into `save_dir`
    pub fn register(&self, meta: TorrentMeta, save_dir: &Path) -> Result<TorrentRecord> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&meta.info_hash) {
            return Err(Error::AlreadyRegistered(meta.info_hash));
        }

        let session = TorrentSession::new(meta, save_dir, self.config.clone());
        let record = TorrentRecord::new(&session);
        tracing::info!(info_hash = %record.info_hash, name = %record.name, "registered a torrent");
        sessions.insert(record.info_hash, Arc::new(session));
        Ok(record)
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(info_hash)
            .cloned()
    }

    fn session(&self, info_hash: &InfoHash) -> Result<Arc<TorrentSession>> {
        self.get(info_hash).ok_or(Error::UnknownTorrent(*info_hash))
    }

    /// Spawns the download of a registered torrent. A torrent can only be started once.
    pub fn start_download(&self, info_hash: &InfoHash) -> Result<JoinHandle<Result<DownloadSummary>>> {
        let session = self.session(info_hash)?;
        if !session.mark_started() {
            return Err(Error::AlreadyStarted(*info_hash));
        }

        Ok(tokio::spawn(async move { session.start().await }))
    }

    pub fn progress(&self, info_hash: &InfoHash) -> Result<Progress> {
        Ok(self.session(info_hash)?.progress())
    }

    pub fn records(&self) -> Vec<TorrentRecord> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut records = sessions
            .values()
            .map(|session| TorrentRecord::new(session))
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Forgets a torrent. A running download keeps going until it finishes.
    pub fn remove(&self, info_hash: &InfoHash) -> Option<TorrentRecord> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(info_hash)
            .map(|session| TorrentRecord::new(&session))
    }
}
