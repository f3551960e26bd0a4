use std::fmt;

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_bencode::BencodeValue;
use serde_with::{serde_as, Bytes};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

/// SHA1 hash of the bencoded `info` dictionary
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

impl Serialize for InfoHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct Info {
    /// Filename (Single File Mode) / Name of the directory (Multi File Mode)
    name: String,
    /// Concatenated piece hashes (20-byte SHA1 hash values). Must be a multiple of 20
    #[serde_as(as = "Bytes")]
    pieces: Vec<u8>,
    /// Number of bytes in each piece
    #[serde(rename = "piece length")]
    piece_length: u64,
    /// Length of the file in bytes (Single File Mode)
    #[serde(default)]
    length: Option<u64>,
    /// Multi File Mode, which isn't supported
    #[serde(default)]
    files: Option<IgnoredAny>,
    #[serde(default)]
    md5sum: Option<String>,
    /// External peer source (Can be either 0 or 1)
    #[serde(default)]
    private: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct MetaInfo {
    info: Info,
    /// The announce URL of the tracker
    announce: String,
    /// The string encoding that is used in the info.pieces
    #[serde(default)]
    encoding: Option<String>,
    /// Tiers of announce URLs (multitracker extension)
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    /// The creation time of the torrent (UNIX epoch format)
    #[serde(default, rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default, rename = "created by")]
    created_by: Option<String>,
}

/// A decoded single-file torrent
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub info_hash: InfoHash,
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub name: String,
    pub piece_length: usize,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub private: bool,
    pub md5sum: Option<String>,
    pub encoding: Option<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl TorrentMeta {
    pub fn from_bytes(torrent: &[u8]) -> Result<Self> {
        let meta_info: MetaInfo = serde_bencode::from_bytes(torrent)?;
        let info_hash = info_hash(torrent)?;

        let MetaInfo {
            info,
            announce,
            encoding,
            announce_list,
            creation_date,
            comment,
            created_by,
        } = meta_info;

        if info.files.is_some() {
            return Err(Error::InvalidMetainfo("multi-file torrents are not supported"));
        }
        let total_length = info
            .length
            .ok_or(Error::InvalidMetainfo("'info.length' is missing"))?;
        if total_length == 0 {
            return Err(Error::InvalidMetainfo("torrent is empty"));
        }
        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("'piece length' must be positive"));
        }
        let piece_length = usize::try_from(info.piece_length)
            .map_err(|_| Error::InvalidMetainfo("'piece length' doesn't fit into memory"))?;
        if info.name.is_empty() || info.name == "." || info.name == ".." || info.name.contains(['/', '\\']) {
            return Err(Error::InvalidMetainfo("'name' must be a plain file name"));
        }

        if info.pieces.len() % 20 != 0 {
            return Err(Error::BadPiecesLength(info.pieces.len()));
        }
        let piece_hashes: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = total_length.div_ceil(info.piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(Error::PieceCountMismatch {
                hashes: piece_hashes.len(),
                expected: expected as usize,
            });
        }

        Ok(TorrentMeta {
            info_hash,
            announce,
            announce_list: announce_list.unwrap_or_default(),
            name: info.name,
            piece_length,
            piece_hashes,
            total_length,
            private: info.private == Some(1),
            md5sum: info.md5sum,
            encoding,
            comment,
            created_by,
            creation_date,
        })
    }

    pub fn number_of_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of the piece at `index`. Only the last piece may be shorter than `piece_length`.
    pub fn piece_size(&self, index: usize) -> usize {
        let last = self.number_of_pieces().saturating_sub(1);
        if index == last {
            (self.total_length - self.piece_length as u64 * last as u64) as usize
        } else {
            self.piece_length
        }
    }

    /// Byte offset of the piece at `index` within the file
    pub fn piece_offset(&self, index: usize) -> u64 {
        self.piece_length as u64 * index as u64
    }

    /// The main announce URL followed by every announce-list entry, without duplicates
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = vec![self.announce.clone()];
        for url in self.announce_list.iter().flatten() {
            if !trackers.contains(url) {
                trackers.push(url.clone());
            }
        }
        trackers
    }
}

/// Hashes the canonical encoding of the `info` dictionary. The dictionary is decoded into a
/// [`BencodeValue`], so keys unknown to [`Info`] are hashed too.
fn info_hash(torrent: &[u8]) -> Result<InfoHash> {
    let value: BencodeValue = serde_bencode::from_bytes(torrent)?;
    let info = value
        .get(b"info")
        .ok_or(Error::InvalidMetainfo("'info' dictionary is missing"))?;
    if !matches!(info, BencodeValue::Dict(_)) {
        return Err(Error::InvalidMetainfo("'info' is not a dictionary"));
    }
    let encoded = serde_bencode::to_bytes(info)?;
    Ok(InfoHash(Sha1::digest(&encoded).into()))
}
