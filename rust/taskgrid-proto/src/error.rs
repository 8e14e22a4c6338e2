//! Error types for the message protocol

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("message payload of {0} bytes exceeds the transport bound")]
    TooLarge(u64),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unknown message kind {0:#x}")]
    UnknownKind(u8),

    #[error("buffer of {have} bytes cannot hold {need} bytes")]
    BufferTooSmall { have: usize, need: usize },

    #[error("metadata blob codec failure: {0}")]
    Blob(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
