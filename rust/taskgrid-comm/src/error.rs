//! Error types for the communication platform

use taskgrid_guid::Location;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("peer {0} is dead")]
    PeerDead(Location),

    #[error("no mailbox registered for {0}")]
    UnknownPeer(Location),

    #[error("message of {size} bytes exceeds the transport bound of {bound}")]
    TooLarge { size: usize, bound: usize },

    #[error(transparent)]
    Proto(#[from] taskgrid_proto::ProtoError),
}

pub type Result<T> = std::result::Result<T, CommError>;
