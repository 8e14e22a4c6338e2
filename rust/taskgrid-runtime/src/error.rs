//! Error types for the runtime assembly

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Policy(#[from] taskgrid_policy::PolicyError),

    #[error(transparent)]
    Guid(#[from] taskgrid_guid::GuidError),

    #[error(transparent)]
    Comm(#[from] taskgrid_comm::CommError),

    #[error(transparent)]
    Config(#[from] taskgrid_config::ConfigError),

    #[error(transparent)]
    Sched(#[from] taskgrid_sched::SchedError),

    #[error("task {guid} already exists")]
    EdtExists {
        guid: taskgrid_guid::Guid,
        /// Output event of the surviving task.
        output_event: taskgrid_guid::Guid,
    },

    #[error("runtime is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
