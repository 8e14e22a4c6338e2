//! Policy-domain assembly
//!
//! Ties the GUID provider, message bus, communication platform, scheduler
//! heuristic and dispatcher into running policy domains: worker threads,
//! the runlevel lifecycle, the distributed shutdown barrier, and the user
//! API the kernel is driven through.

pub mod api;
pub mod cluster;
pub mod domain;
pub mod error;
pub mod runlevel;
pub mod worker;

pub use api::{EdtHandle, EdtSpec, PdApi};
pub use cluster::Cluster;
pub use domain::PolicyDomain;
pub use error::{Result, RuntimeError};
pub use runlevel::{phases_down, phases_up, RlSwitch};
