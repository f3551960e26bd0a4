//! In-process torrents, seeders and trackers for tests

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bittorrent_peer_protocol::{BittorrentP2pMessage, Bitfield, Block, BlockRequest, Encode, Handshake};
use bytes::Bytes;
use serde::Serialize;
use serde_with::serde_as;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tokio::sync::{mpsc, watch};

use crate::buffer::ReadBuf;
use crate::peer::{PeerContext, PeerEvent, PieceResult};
use crate::piece::PieceProgress;
use crate::queue::WorkQueue;
use crate::{PeerError, SessionConfig, TorrentMeta};

pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub struct TorrentSpec {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub name: String,
    pub piece_length: usize,
    pub data: Vec<u8>,
}

impl TorrentSpec {
    pub fn new(data: &[u8]) -> Self {
        TorrentSpec {
            announce: "http://127.0.0.1:1/announce".to_string(),
            announce_list: Vec::new(),
            name: "file.bin".to_string(),
            piece_length: 16384,
            data: data.to_vec(),
        }
    }
}

#[serde_as]
#[derive(Serialize)]
struct RawInfo<'a> {
    name: &'a str,
    length: u64,
    #[serde(rename = "piece length")]
    piece_length: u64,
    #[serde_as(as = "serde_with::Bytes")]
    pieces: Vec<u8>,
}

#[derive(Serialize)]
struct RawTorrent<'a> {
    announce: &'a str,
    #[serde(rename = "announce-list", skip_serializing_if = "Vec::is_empty")]
    announce_list: Vec<Vec<String>>,
    info: RawInfo<'a>,
}

pub fn build_torrent(spec: &TorrentSpec) -> Vec<u8> {
    let pieces = spec
        .data
        .chunks(spec.piece_length)
        .flat_map(|chunk| -> [u8; 20] { Sha1::digest(chunk).into() })
        .collect();
    let torrent = RawTorrent {
        announce: &spec.announce,
        announce_list: spec.announce_list.clone(),
        info: RawInfo {
            name: &spec.name,
            length: spec.data.len() as u64,
            piece_length: spec.piece_length as u64,
            pieces,
        },
    };
    serde_bencode::to_bytes(&torrent).expect("failed to encode a torrent")
}

pub fn meta_for(data: &[u8], piece_length: usize, announce: &str) -> TorrentMeta {
    let spec = TorrentSpec {
        piece_length,
        announce: announce.to_string(),
        ..TorrentSpec::new(data)
    };
    TorrentMeta::from_bytes(&build_torrent(&spec)).expect("failed to decode a generated torrent")
}

/// Timeouts short enough for tests
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(10),
        tracker_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

/// A peer context with every piece of `meta` queued, and the receiving ends of its channels
pub struct PeerHarness {
    pub ctx: Arc<PeerContext>,
    pub results_rx: mpsc::Receiver<PieceResult>,
    pub events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    pub bitfield_tx: watch::Sender<Bitfield>,
}

pub fn all_pieces(meta: &TorrentMeta) -> Vec<PieceProgress> {
    (0..meta.number_of_pieces())
        .map(|index| PieceProgress::new(index as u32, meta.piece_size(index), meta.piece_hashes[index]))
        .collect()
}

pub fn peer_harness(meta: TorrentMeta, config: SessionConfig) -> PeerHarness {
    let (results_tx, results_rx) = mpsc::channel(4);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (bitfield_tx, bitfield) = watch::channel(Bitfield::new(meta.number_of_pieces()));

    PeerHarness {
        ctx: Arc::new(PeerContext {
            queue: Arc::new(WorkQueue::new(all_pieces(&meta))),
            meta: Arc::new(meta),
            peer_id: *b"-FB0100-testtesttest",
            config,
            results_tx,
            events_tx,
            bitfield,
        }),
        results_rx,
        events_rx,
        bitfield_tx,
    }
}

pub fn compact_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    peers
        .iter()
        .flat_map(|peer| {
            let mut entry = peer.ip().octets().to_vec();
            entry.extend_from_slice(&peer.port().to_be_bytes());
            entry
        })
        .collect()
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = v4(listener.local_addr().expect("no local address"));
    drop(listener);
    addr
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederBehavior {
    Honest,
    /// Answers the handshake with someone else's info hash
    WrongInfoHash,
    /// Serves every block with its bits flipped
    CorruptBlocks,
}

/// Starts a peer that has every piece of `data`. Returns its address and the number of
/// connections it accepted so far.
pub async fn spawn_seeder(
    meta: &TorrentMeta,
    data: Vec<u8>,
    behavior: SeederBehavior,
) -> (SocketAddrV4, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind a seeder");
    let addr = v4(listener.local_addr().expect("no local address"));
    let connections = Arc::new(AtomicUsize::new(0));

    let info_hash = match behavior {
        SeederBehavior::WrongInfoHash => [0xee; 20],
        _ => meta.info_hash.0,
    };
    let piece_length = meta.piece_length;
    let number_of_pieces = meta.number_of_pieces();
    let data = Arc::new(data);
    let accepted = connections.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_peer(
                stream,
                info_hash,
                piece_length,
                number_of_pieces,
                data.clone(),
                behavior,
            ));
        }
    });

    (addr, connections)
}

async fn serve_peer(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    piece_length: usize,
    number_of_pieces: usize,
    data: Arc<Vec<u8>>,
    behavior: SeederBehavior,
) -> Result<(), PeerError> {
    let mut read_buf = ReadBuf::new();
    read_buf.read_handshake(&mut stream).await?;

    let mut output = Vec::new();
    Handshake::new(info_hash, *b"-XX0000-fakeseeder00")
        .encode(&mut output)
        .await?;
    let mut bitfield = Bitfield::new(number_of_pieces);
    for index in 0..number_of_pieces {
        bitfield.set_piece(index);
    }
    BittorrentP2pMessage::Bitfield(bitfield).encode(&mut output).await?;
    stream.write_all(&output).await?;

    loop {
        output.clear();
        match read_buf.read_message(&mut stream).await? {
            BittorrentP2pMessage::Interested => BittorrentP2pMessage::Unchoke.encode(&mut output).await?,
            BittorrentP2pMessage::Request(BlockRequest { index, begin, length }) => {
                let start = index as usize * piece_length + begin as usize;
                let mut block = data[start..start + length as usize].to_vec();
                if behavior == SeederBehavior::CorruptBlocks {
                    block.iter_mut().for_each(|byte| *byte = !*byte);
                }
                BittorrentP2pMessage::Piece(Block {
                    index,
                    begin,
                    data: Bytes::from(block),
                })
                .encode(&mut output)
                .await?;
            }
            _ => {}
        }
        stream.write_all(&output).await?;
    }
}

/// Starts an HTTP tracker that answers every request with `body`. Returns the announce URL and
/// the request lines it received.
pub async fn spawn_tracker(body: Vec<u8>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind a tracker");
    let addr = listener.local_addr().expect("no local address");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => head.extend_from_slice(&buf[..read]),
                }
            }

            let head = String::from_utf8_lossy(&head);
            let request_line = head.lines().next().unwrap_or_default().to_string();
            seen.lock().expect("lock poisoned").push(request_line);

            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(&body);
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{}/announce", addr), requests)
}
