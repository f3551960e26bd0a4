use std::fmt::Debug;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("an IO error happened: {0}")]
    IoError(#[from] std::io::Error),
    #[error("an error happened when converting a value: {0}")]
    ConversionError(&'static str),
    #[error("expected at least {1} bytes while got {0}")]
    BadLength(usize, usize),
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("handshake has an empty protocol string")]
    EmptyProtocolString,
    #[error("unexpected protocol string {0:?}")]
    ProtocolMismatch(String),
    #[error("{id:?} message needs at least {expected} bytes of payload, got {actual}")]
    MalformedMessage {
        id: crate::MessageId,
        expected: usize,
        actual: usize,
    },
}
