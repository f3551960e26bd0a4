use std::fmt::Debug;
use std::result;
use std::time::Duration;

use bittorrent_peer_protocol::MessageId;
use thiserror::Error;

use crate::torrent_meta::InfoHash;

pub type Result<T> = result::Result<T, Error>;

/// Errors visible to the caller of a torrent session
#[derive(Error, Debug)]
pub enum Error {
    #[error("error while parsing bencoded data: {0}")]
    Decode(#[from] serde_bencode::Error),
    #[error("'pieces' is {0} bytes long, which is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("torrent has {hashes} piece hashes, but its length requires {expected}")]
    PieceCountMismatch { hashes: usize, expected: usize },
    #[error("invalid torrent metainfo: {0}")]
    InvalidMetainfo(&'static str),
    #[error("compact peer list is {0} bytes long, which is not a multiple of 6")]
    MalformedPeers(usize),
    #[error("tracker refused the announce: {0}")]
    TrackerFailure(String),
    #[error("error while contacting the tracker: {0}")]
    TrackerTransport(#[from] reqwest::Error),
    #[error("bad announce URL: {0}")]
    BadAnnounceUrl(#[from] url::ParseError),
    #[error("failed to build the announce query: {0}")]
    TrackerQuery(#[from] serde_urlencoded::ser::Error),
    #[error("no peers to download from")]
    NoPeers,
    #[error("download stalled: {missing} pieces are missing and no peers are left")]
    DownloadStalled { missing: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("torrent {0} is already registered")]
    AlreadyRegistered(InfoHash),
    #[error("torrent {0} is not registered")]
    UnknownTorrent(InfoHash),
    #[error("download of torrent {0} was already started")]
    AlreadyStarted(InfoHash),
}

#[derive(Error, Debug)]
#[error("'{operation}' timed out after {after:?}")]
pub struct TimedOut {
    pub operation: &'static str,
    pub after: Duration,
}

/// Errors that end a single peer connection. They never reach the scheduler.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error(transparent)]
    TimedOut(#[from] TimedOut),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("error while encoding or decoding a peer message: {0}")]
    Protocol(#[from] bittorrent_peer_protocol::Error),
    #[error("peer is serving a different torrent: {0}")]
    InfoHashMismatch(InfoHash),
    #[error("expected a bitfield as the first message, got {0:?}")]
    UnexpectedFirstMessage(Option<MessageId>),
    #[error("peer sent a block outside of piece {index}: offset {begin}, {length} bytes")]
    BadBlock { index: u32, begin: u32, length: usize },
    #[error("peer referenced piece {0}, which doesn't exist")]
    PieceOutOfRange(u32),
    #[error("peer announced a {0} byte message")]
    MessageTooLarge(usize),
    #[error("{0} pieces from this peer failed hash verification")]
    TooManyRejectedPieces(usize),
}

impl PeerError {
    /// Transport failures are worth another connection attempt, protocol violations are not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerError::Transport(_) | PeerError::TimedOut(_) | PeerError::ConnectionClosed
        )
    }
}
