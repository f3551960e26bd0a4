use bytes::Buf;
use std::{borrow::Cow, io::Cursor};
use tokio::io::AsyncWriteExt;

use crate::{Decode, Encode, Error, Result};

/// The handshake is a required message and must be the first message transmitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake<'a> {
    /// String identifier of the protocol. Its length should fit into a *single* byte
    pub pstr: Cow<'a, str>,
    /// Eight reserved bytes that are used to specify extensions of the Bittorrent protocol.
    /// Always zero when sent by us, ignored when received.
    pub extension_bytes: u64,
    /// 20-byte SHA1 hash of the info key in the metainfo file. It's the same hash that was
    /// transmitted in the tracker request.
    pub info_hash: [u8; 20],
    /// 20-byte unique ID for the client. This is usually the same peer ID that was sent in the
    /// tracker request.
    pub peer_id: [u8; 20],
}

impl<'a> Handshake<'a> {
    /// Everything except the protocol string itself
    pub const FIXED_PART_LENGTH: usize = 1 + 8 + 20 + 20;
    pub const DEFAULT_PSTR: &'static str = "BitTorrent protocol";

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            pstr: Cow::Borrowed(Handshake::DEFAULT_PSTR),
            extension_bytes: 0,
            info_hash,
            peer_id,
        }
    }

    /// Total number of bytes this handshake occupies on the wire
    pub fn wire_length(&self) -> usize {
        Self::FIXED_PART_LENGTH + self.pstr.len()
    }

    pub fn into_owned(self) -> Handshake<'static> {
        Handshake {
            pstr: Cow::Owned(self.pstr.into_owned()),
            extension_bytes: self.extension_bytes,
            info_hash: self.info_hash,
            peer_id: self.peer_id,
        }
    }
}

impl<'a> Encode for Handshake<'a> {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        let pstr_len: u8 = self
            .pstr
            .len()
            .try_into()
            .map_err(|_| Error::ConversionError("protocol string is longer than 255 bytes"))?;
        dst.write_all(&[pstr_len]).await?;
        dst.write_all(self.pstr.as_bytes()).await?;
        // 8 reserved bytes
        dst.write_all(&self.extension_bytes.to_be_bytes()).await?;
        dst.write_all(&self.info_hash).await?;
        dst.write_all(&self.peer_id).await?;

        Ok(())
    }
}

impl<'a> Decode<'a> for Handshake<'a> {
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.len(), 1);

        let pstr_len = src[0] as usize;
        if pstr_len == 0 {
            return Err(Error::EmptyProtocolString);
        }
        check_length!(src.len(), Self::FIXED_PART_LENGTH + pstr_len);

        let pstr_bytes = &src[1..1 + pstr_len];
        let pstr = String::from_utf8_lossy(pstr_bytes);
        if pstr != Self::DEFAULT_PSTR {
            return Err(Error::ProtocolMismatch(pstr.into_owned()));
        }

        let mut src = Cursor::new(&src[1 + pstr_len..]);
        let extension_bytes = src.get_u64();

        let mut info_hash = [0; 20];
        src.copy_to_slice(info_hash.as_mut());

        let mut peer_id = [0; 20];
        src.copy_to_slice(peer_id.as_mut());

        Ok(Handshake {
            pstr,
            extension_bytes,
            info_hash,
            peer_id,
        })
    }
}
