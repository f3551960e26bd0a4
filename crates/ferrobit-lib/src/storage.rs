use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bittorrent_peer_protocol::Bitfield;

use crate::piece::calculate_piece_hash;
use crate::TorrentMeta;

/// Random-access storage for the content of a single-file torrent
pub trait Storage: Send + Sync {
    fn write_all(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    /// Returns `false` if the storage ends before `buf` is filled
    fn read_exact(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<bool>;
}

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: File,
    existed: bool,
}

impl FileStorage {
    /// Opens the output file, creating it and its parent directories when needed.
    /// An existing file is never truncated, only resized to `length`.
    pub fn open(path: &Path, length: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let existed = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)?;
        file.set_len(length)?;

        Ok(FileStorage {
            path: path.to_path_buf(),
            file,
            existed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was already there before [`FileStorage::open`]
    pub fn existed(&self) -> bool {
        self.existed
    }
}

impl Storage for FileStorage {
    #[tracing::instrument(level = "trace", err, skip(self, data), fields(len = data.len()))]
    fn write_all(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    #[tracing::instrument(level = "trace", err, skip(self, buf))]
    fn read_exact(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<bool> {
        match self.file.read_exact_at(buf, offset) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory storage, used to run the scheduler without touching the disk
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct MemoryStorage {
    pub data: Vec<u8>,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new(length: usize) -> Self {
        MemoryStorage { data: vec![0; length] }
    }
}

#[cfg(test)]
impl Storage for MemoryStorage {
    fn write_all(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_exact(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<bool> {
        let start = offset as usize;
        match self.data.get(start..start + buf.len()) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Hashes the pieces already present in `storage` and returns the ones that match the torrent
#[tracing::instrument(level = "debug", err, skip_all, fields(info_hash = %meta.info_hash))]
pub fn verify_existing_pieces(storage: &mut dyn Storage, meta: &TorrentMeta) -> io::Result<Bitfield> {
    let mut bitfield = Bitfield::new(meta.number_of_pieces());
    let mut buf = vec![0; meta.piece_length];

    for (index, expected) in meta.piece_hashes.iter().enumerate() {
        let piece = &mut buf[..meta.piece_size(index)];
        if storage.read_exact(meta.piece_offset(index), piece)? && calculate_piece_hash(piece) == *expected {
            bitfield.set_piece(index);
        }
    }

    tracing::debug!(
        "{} out of {} pieces are already present",
        bitfield.count_ones(),
        meta.number_of_pieces()
    );
    Ok(bitfield)
}
