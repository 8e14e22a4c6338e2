//! Policy-domain dispatcher and runtime objects
//!
//! Classifies every policy message, decides local versus remote handling,
//! maintains the task/event/datablock records the kernel observes, drives
//! the metadata-clone protocol, and packages responses for requests that
//! arrived from other policy domains.

pub mod dispatcher;
pub mod error;
pub mod objects;
pub mod registry;
pub mod strand;

pub use dispatcher::{
    AsyncExecutor, Dispatcher, GetWorkReply, LifecycleHooks, MsgTransport, SchedulerHooks,
};
pub use error::{PolicyError, Result};
pub use objects::{
    AffinityRecord, DbRecord, EdtRecord, EdtState, EventRecord, MdState, TemplateRecord, Waiter,
    EDT_PROP_FINISH, LATCH_DECR_SLOT, LATCH_INCR_SLOT,
};
pub use registry::{EdtDep, EdtFn, FuncRegistry, ObjectCodec, ObjectRegistry};
pub use strand::{Action, NpKind, PdEvent, Strand, StrandTable};
