mod bitfield;
mod handshake;
mod p2p_message;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use p2p_message::{BittorrentP2pMessage, Block, BlockRequest, MessageId};
