//! Error types for the scheduler heuristic

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("no scheduler context covers location {0}")]
    UnknownContext(taskgrid_guid::Location),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SchedError>;
