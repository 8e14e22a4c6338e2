//! Scheduler heuristic
//!
//! Per-context work deques, affinity-aware placement, pull-based work
//! stealing with a two-phase (affinitized, then non-affinitized) victim
//! protocol, and pending-request bookkeeping. One context exists per
//! local compute worker and per neighbor policy domain; the heuristic
//! entry is serialized, which is the single-owner discipline that keeps
//! contexts lock-free.

pub mod context;
pub mod deque;
pub mod error;
pub mod heuristic;

pub use context::{PendingRequest, ReplySlot, SchedContext};
pub use deque::WorkDeque;
pub use error::{Result, SchedError};
pub use heuristic::{
    GetWorkOutcome, LocalWork, PlacementOracle, SchedulerHeuristic, SendFailure, UpdateProp,
    WorkMsgSender,
};
