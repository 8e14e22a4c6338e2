//! Error types for the GUID layer

use crate::bitmap::Guid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuidError {
    #[error("guid {0} already exists")]
    GuidExists(Guid),

    #[error("operation is pending on a remote fetch")]
    Pending,

    #[error("operation not supported by this provider: {0}")]
    NotSupported(&'static str),

    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("guid counter exhausted for worker {worker}")]
    CounterExhausted { worker: usize },
}

pub type Result<T> = std::result::Result<T, GuidError>;
