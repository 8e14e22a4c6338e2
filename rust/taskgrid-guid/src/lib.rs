//! GUID provider and metadata proxy layer
//!
//! Every runtime object is named by a cluster-unique GUID that encodes its
//! kind and its home policy domain. This crate owns the bit layout, the
//! concurrent GUID -> metadata map, the proxy objects that stand in for
//! remote metadata, and the two provider flavors (counted and labeled).

pub mod bitmap;
pub mod error;
pub mod map;
pub mod provider;
pub mod proxy;
pub mod record;

pub use bitmap::{Guid, GuidKind, Location};
pub use error::{GuidError, Result};
pub use map::{GuidEntry, GuidMap};
pub use provider::{
    CountedMapProvider, FetchOutcome, GuidProps, GuidProvider, LabeledGuidProvider, ResolveMode,
};
pub use proxy::{DeferredAction, MdProxy};
pub use record::{FatGuid, GuidObject, ReadyWord};
