use crate::{Bitfield, Decode, Encode, Error, Result};
use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    /// Smallest payload (excluding the id byte) a message with this id may carry
    pub fn min_payload_length(self) -> usize {
        match self {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => 0,
            MessageId::Bitfield => 0,
            MessageId::Have => 4,
            MessageId::Request | MessageId::Cancel => 12,
            MessageId::Piece => 8,
            MessageId::Port => 2,
        }
    }
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            unknown => return Err(Error::UnknownMessageId(unknown)),
        })
    }
}

/// A block request, also used as the payload of `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    /// Zero-based piece index
    pub index: u32,
    /// Zero-based byte offset within the piece
    pub begin: u32,
    pub length: u32,
}

/// A single block of piece data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

/// Represents all possible `Peer Wire Protocol` messages
/// [Source](https://wiki.theory.org/BitTorrentSpecification#Messages)
#[derive(Debug, Clone, PartialEq)]
pub enum BittorrentP2pMessage {
    /// The keep-alive message is a message with zero bytes, specified with the length prefix set to zero.
    /// There is no message ID and no payload.
    KeepAlive,
    /// When a peer chokes the client, it is a notification that no requests will be answered until the client is unchoked.
    /// The client should not attempt to send requests for blocks, and it should consider all pending (unanswered) requests
    /// to be discarded by the remote peer.
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The payload is the zero-based index of a piece that has just been successfully downloaded and verified via the hash.
    Have(u32),
    /// May only be sent immediately after the handshaking sequence is completed, and before any other messages are sent.
    ///
    /// The high bit in the first byte corresponds to piece index 0. Spare bits at the end are set to zero.
    Bitfield(Bitfield),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    /// The listen port of the peer's DHT node
    Port(u16),
}

impl BittorrentP2pMessage {
    pub const FIXED_PART_LENGTH: usize = 4 /* length */;

    pub fn message_id(&self) -> Option<MessageId> {
        use BittorrentP2pMessage::{
            Bitfield, Cancel, Choke, Have, Interested, KeepAlive, NotInterested, Piece, Port, Request, Unchoke,
        };

        Some(match self {
            KeepAlive => return None,
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have(_) => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request(_) => MessageId::Request,
            Piece(_) => MessageId::Piece,
            Cancel(_) => MessageId::Cancel,
            Port(_) => MessageId::Port,
        })
    }

    /// Value of the length prefix: the id byte plus the payload
    pub fn length_and_message_id(&self) -> Result<(u32, Option<MessageId>)> {
        use BittorrentP2pMessage::{
            Bitfield, Cancel, Choke, Have, Interested, KeepAlive, NotInterested, Piece, Port, Request, Unchoke,
        };

        let length = match self {
            KeepAlive => 0,
            Choke | Unchoke | Interested | NotInterested => 1,
            Have(_) => 5,
            Bitfield(bitfield) => 1 + bitfield.as_bytes().len(),
            Request(_) | Cancel(_) => 13,
            Piece(block) => 9 + block.data.len(),
            Port(_) => 3,
        };

        let length =
            u32::try_from(length).map_err(|_| Error::ConversionError("message length doesn't fit into a u32"))?;
        Ok((length, self.message_id()))
    }
}

async fn write_block_request<T>(dst: &mut T, request: &BlockRequest) -> Result<()>
where
    T: AsyncWriteExt + Unpin,
{
    dst.write_all(&request.index.to_be_bytes()).await?;
    dst.write_all(&request.begin.to_be_bytes()).await?;
    dst.write_all(&request.length.to_be_bytes()).await?;
    Ok(())
}

fn read_block_request(src: &mut Cursor<&[u8]>) -> BlockRequest {
    BlockRequest {
        index: src.get_u32(),
        begin: src.get_u32(),
        length: src.get_u32(),
    }
}

impl Encode for BittorrentP2pMessage {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        use BittorrentP2pMessage::{
            Bitfield, Cancel, Choke, Have, Interested, KeepAlive, NotInterested, Piece, Port, Request, Unchoke,
        };

        let (length, message_id) = self.length_and_message_id()?;

        dst.write_all(&length.to_be_bytes()).await?;

        if let Some(message_id) = message_id {
            dst.write_all(&[message_id as u8]).await?;
        }

        match self {
            // These message types have no additional info
            KeepAlive | Choke | Unchoke | Interested | NotInterested => {}
            Have(piece_idx) => {
                dst.write_all(&piece_idx.to_be_bytes()).await?;
            }
            Bitfield(bitfield) => {
                dst.write_all(bitfield.as_bytes()).await?;
            }
            Request(request) | Cancel(request) => write_block_request(dst, request).await?,
            Piece(block) => {
                dst.write_all(&block.index.to_be_bytes()).await?;
                dst.write_all(&block.begin.to_be_bytes()).await?;
                dst.write_all(&block.data).await?;
            }
            Port(port) => {
                dst.write_all(&port.to_be_bytes()).await?;
            }
        };

        Ok(())
    }
}

impl<'a> Decode<'a> for BittorrentP2pMessage {
    /// Decodes one complete frame, length prefix included
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.remaining(), Self::FIXED_PART_LENGTH);

        let mut src = Cursor::new(src);

        let length: usize = src
            .get_u32()
            .try_into()
            .map_err(|_| Error::ConversionError("error when converting BitTorrent message length to usize"))?;

        if length == 0 {
            return Ok(BittorrentP2pMessage::KeepAlive);
        }

        check_length!(src.remaining(), length);

        let message_id: MessageId = src.get_u8().try_into()?;
        let payload_length = length - 1;
        if payload_length < message_id.min_payload_length() {
            return Err(Error::MalformedMessage {
                id: message_id,
                expected: message_id.min_payload_length(),
                actual: payload_length,
            });
        }

        Ok(match message_id {
            MessageId::Choke => Self::Choke,
            MessageId::Unchoke => Self::Unchoke,
            MessageId::Interested => Self::Interested,
            MessageId::NotInterested => Self::NotInterested,
            MessageId::Have => Self::Have(src.get_u32()),
            MessageId::Bitfield => {
                let offset = src.position() as usize;
                Self::Bitfield(Bitfield::from_bytes(&src.get_ref()[offset..offset + payload_length]))
            }
            MessageId::Request => Self::Request(read_block_request(&mut src)),
            MessageId::Piece => {
                let index = src.get_u32();
                let begin = src.get_u32();
                let block_length = payload_length - std::mem::size_of::<u32>() * 2 /* index + begin */;
                let data = src.copy_to_bytes(block_length);
                Self::Piece(Block { index, begin, data })
            }
            MessageId::Cancel => Self::Cancel(read_block_request(&mut src)),
            MessageId::Port => Self::Port(src.get_u16()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encoded(message: &BittorrentP2pMessage) -> Vec<u8> {
        let mut buf = Vec::new();
        message.encode(&mut buf).await.expect("failed to encode a message");
        buf
    }

    #[tokio::test]
    async fn request_is_seventeen_bytes() {
        let request = BittorrentP2pMessage::Request(BlockRequest {
            index: 3,
            begin: 0,
            length: 16384,
        });
        let bytes = encoded(&request).await;
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[..5], &[0, 0, 0, 13, 6]);
        assert_eq!(BittorrentP2pMessage::decode(&bytes).expect("failed to decode a request"), request);
    }

    #[tokio::test]
    async fn every_message_kind_survives_the_wire() {
        let messages = [
            BittorrentP2pMessage::KeepAlive,
            BittorrentP2pMessage::Choke,
            BittorrentP2pMessage::Unchoke,
            BittorrentP2pMessage::Interested,
            BittorrentP2pMessage::NotInterested,
            BittorrentP2pMessage::Have(42),
            BittorrentP2pMessage::Bitfield(Bitfield::from_bytes(&[0b1010_0000, 0x01])),
            BittorrentP2pMessage::Piece(Block {
                index: 1,
                begin: 16384,
                data: Bytes::from_static(b"some block data"),
            }),
            BittorrentP2pMessage::Cancel(BlockRequest {
                index: 1,
                begin: 0,
                length: 9,
            }),
            BittorrentP2pMessage::Port(6881),
        ];

        for message in messages {
            let bytes = encoded(&message).await;
            let (length, _) = message.length_and_message_id().expect("length should fit");
            assert_eq!(bytes.len(), 4 + length as usize);
            assert_eq!(BittorrentP2pMessage::decode(&bytes).expect("failed to decode"), message);
        }
    }

    #[tokio::test]
    async fn bitfield_length_counts_bytes_not_bits() {
        let bitfield = Bitfield::new(10);
        let bytes = encoded(&BittorrentP2pMessage::Bitfield(bitfield)).await;
        assert_eq!(&bytes[..4], &[0, 0, 0, 3]);
        assert_eq!(bytes.len(), 7);
    }

    #[test]
    fn short_have_is_malformed() {
        let bytes = [0, 0, 0, 3, 4, 0, 0];
        assert!(matches!(
            BittorrentP2pMessage::decode(&bytes),
            Err(Error::MalformedMessage {
                id: MessageId::Have,
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn short_piece_is_malformed() {
        let bytes = [0, 0, 0, 5, 7, 0, 0, 0, 1];
        assert!(matches!(
            BittorrentP2pMessage::decode(&bytes),
            Err(Error::MalformedMessage {
                id: MessageId::Piece,
                expected: 8,
                actual: 4
            })
        ));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let bytes = [0, 0, 0, 1, 20];
        assert!(matches!(
            BittorrentP2pMessage::decode(&bytes),
            Err(Error::UnknownMessageId(20))
        ));
    }

    #[test]
    fn incomplete_frame_is_rejected() {
        let bytes = [0, 0, 0, 5, 4, 0];
        assert!(matches!(BittorrentP2pMessage::decode(&bytes), Err(Error::BadLength(2, 5))));
    }
}
