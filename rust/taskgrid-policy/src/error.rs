//! Error types for the policy domain

use taskgrid_guid::Guid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    /// Completion requires a remote fetch or a parked reply.
    #[error("operation is pending")]
    Pending,

    #[error("resource is busy, retry later")]
    Busy,

    #[error("guid {0} already exists")]
    GuidExists(Guid),

    #[error("invalid operation: {0}")]
    Invalid(&'static str),

    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error(transparent)]
    Guid(#[from] taskgrid_guid::GuidError),

    #[error(transparent)]
    Proto(#[from] taskgrid_proto::ProtoError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("metadata codec failure: {0}")]
    Codec(#[from] bincode::Error),
}

impl PolicyError {
    pub fn return_code(&self) -> taskgrid_proto::ReturnCode {
        use taskgrid_proto::ReturnCode;
        match self {
            PolicyError::Pending => ReturnCode::Pending,
            PolicyError::Busy => ReturnCode::Busy,
            PolicyError::GuidExists(_) => ReturnCode::GuidExists,
            PolicyError::Invalid(_) => ReturnCode::Invalid,
            PolicyError::NotPermitted(_) => ReturnCode::NotPermitted,
            PolicyError::NotSupported(_) => ReturnCode::NotSupported,
            PolicyError::Guid(e) => match e {
                taskgrid_guid::GuidError::GuidExists(_) => ReturnCode::GuidExists,
                taskgrid_guid::GuidError::Pending => ReturnCode::Pending,
                taskgrid_guid::GuidError::NotSupported(_) => ReturnCode::NotSupported,
                taskgrid_guid::GuidError::NotPermitted(_) => ReturnCode::NotPermitted,
                taskgrid_guid::GuidError::CounterExhausted { .. } => ReturnCode::NoMemory,
                taskgrid_guid::GuidError::Invalid(_) => ReturnCode::Invalid,
            },
            PolicyError::Proto(_) | PolicyError::Codec(_) => ReturnCode::Invalid,
            PolicyError::Transport(_) => ReturnCode::Busy,
        }
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
