use bittorrent_peer_protocol::{BittorrentP2pMessage, Decode, Handshake};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::PeerError;

/// Frames larger than this are refused instead of buffered
pub const MAX_MESSAGE_LENGTH: usize = 2 * 1024 * 1024;

/// Accumulates bytes read from a peer until a complete handshake or message is available.
/// Bytes that belong to the next frame are kept for the next call.
pub struct ReadBuf {
    inner: Vec<u8>,
    /// Filled bytes
    offset: usize,
    /// Bytes of `inner` that belong to the last returned frame
    processed: usize,
}

impl ReadBuf {
    const DEFAULT_BUFFER_CAPACITY: usize = 16_384 * 2;

    pub fn new() -> Self {
        ReadBuf {
            inner: vec![0; ReadBuf::DEFAULT_BUFFER_CAPACITY],
            offset: 0,
            processed: 0,
        }
    }

    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all)]
    pub async fn read_handshake<S>(&mut self, stream: &mut S) -> Result<Handshake<'static>, PeerError>
    where
        S: AsyncRead + Unpin,
    {
        self.reset_processed();
        loop {
            if self.offset > 0 {
                let pstr_length = self.inner[0] as usize;
                let frame_length = Handshake::FIXED_PART_LENGTH + pstr_length;

                // An empty protocol string fails right away instead of waiting for more bytes
                if pstr_length == 0 || self.offset >= frame_length {
                    let handshake = Handshake::decode(&self.inner[..self.offset.min(frame_length)])?.into_owned();
                    self.processed = frame_length;
                    return Ok(handshake);
                }
            }

            self.fill(stream).await?;
        }
    }

    /// Cancel safe: bytes read before cancellation stay buffered
    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all)]
    pub async fn read_message<S>(&mut self, stream: &mut S) -> Result<BittorrentP2pMessage, PeerError>
    where
        S: AsyncRead + Unpin,
    {
        self.reset_processed();
        loop {
            if self.offset >= BittorrentP2pMessage::FIXED_PART_LENGTH {
                let message_length =
                    u32::from_be_bytes([self.inner[0], self.inner[1], self.inner[2], self.inner[3]]) as usize;
                if message_length > MAX_MESSAGE_LENGTH {
                    return Err(PeerError::MessageTooLarge(message_length));
                }

                let frame_length = BittorrentP2pMessage::FIXED_PART_LENGTH + message_length;
                if self.offset >= frame_length {
                    let message = BittorrentP2pMessage::decode(&self.inner[..frame_length])?;
                    self.processed = frame_length;
                    return Ok(message);
                }

                // Account for some large messages (e.g. a huge bitfield)
                if frame_length > self.inner.len() {
                    tracing::trace!("resizing the buffer: {} -> {}", self.inner.len(), frame_length);
                    self.inner.resize(frame_length, 0);
                }
            }

            self.fill(stream).await?;
        }
    }

    async fn fill<S>(&mut self, stream: &mut S) -> Result<(), PeerError>
    where
        S: AsyncRead + Unpin,
    {
        if self.offset == self.inner.len() {
            self.inner.resize(self.inner.len() * 2, 0);
        }

        let read = stream.read(&mut self.inner[self.offset..]).await?;
        if read == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        self.offset += read;
        Ok(())
    }

    fn reset_processed(&mut self) {
        if self.processed > 0 {
            if self.offset > self.processed {
                self.inner.copy_within(self.processed..self.offset, 0);
            }
            self.offset -= self.processed;
            self.processed = 0;
        }
    }
}

impl Default for ReadBuf {
    fn default() -> Self {
        ReadBuf::new()
    }
}
