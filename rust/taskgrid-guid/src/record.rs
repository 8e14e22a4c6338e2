//! Metadata records
//!
//! Every object registered with the GUID provider carries a ready word:
//! once the object is fully initialized the word holds the object's own
//! GUID, which racy readers of labeled creations poll before touching the
//! rest of the record.

use crate::bitmap::{Guid, GuidKind};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Publication word placed at the head of every metadata record.
#[derive(Debug, Default)]
pub struct ReadyWord {
    word: AtomicU64,
}

impl ReadyWord {
    pub fn new() -> ReadyWord {
        ReadyWord {
            word: AtomicU64::new(0),
        }
    }

    /// Mark the record initialized. Release ordering so every prior write
    /// to the record is visible to a reader that observes the GUID.
    pub fn publish(&self, guid: Guid) {
        self.word.store(guid.raw(), Ordering::Release);
    }

    pub fn is_ready(&self, guid: Guid) -> bool {
        self.word.load(Ordering::Acquire) == guid.raw()
    }

    /// Spin until the record is published under `guid`.
    pub fn wait_ready(&self, guid: Guid) {
        while !self.is_ready(guid) {
            std::hint::spin_loop();
        }
    }
}

/// Object state reachable through the GUID map.
///
/// Implemented by the runtime's record types (EDTs, events, datablocks,
/// templates, affinities). The map only ever holds `Arc<dyn GuidObject>`;
/// cross-object references are GUIDs resolved back through the map, which
/// is what breaks the proxy/metadata ownership cycle.
pub trait GuidObject: Send + Sync + 'static {
    /// The publication word at the head of the record.
    fn ready_word(&self) -> &ReadyWord;

    fn kind(&self) -> GuidKind;

    fn as_any(&self) -> &dyn Any;
}

/// A GUID together with its locally-resolved metadata, when known.
#[derive(Clone)]
pub struct FatGuid {
    pub guid: Guid,
    pub metadata: Option<std::sync::Arc<dyn GuidObject>>,
}

impl FatGuid {
    pub fn null() -> FatGuid {
        FatGuid {
            guid: Guid::NULL,
            metadata: None,
        }
    }

    pub fn from_guid(guid: Guid) -> FatGuid {
        FatGuid {
            guid,
            metadata: None,
        }
    }
}

impl std::fmt::Debug for FatGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatGuid")
            .field("guid", &self.guid)
            .field("resolved", &self.metadata.is_some())
            .finish()
    }
}
