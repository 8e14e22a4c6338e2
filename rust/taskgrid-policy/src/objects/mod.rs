//! Runtime object records
//!
//! Metadata for templates, EDTs, events, datablocks and affinities. Every
//! record starts with a ready word that is published once the record is
//! fully initialized; cross-record references are GUIDs resolved through
//! the provider map, never direct pointers.

mod edt;
mod event;

pub use edt::{EdtRecord, EdtState, MdState};
pub use event::{EventRecord, Waiter, LATCH_DECR_SLOT, LATCH_INCR_SLOT};

use parking_lot::Mutex;
use std::any::Any;
use taskgrid_guid::{Guid, GuidKind, GuidObject, Location, ReadyWord};
use taskgrid_proto::{DbHint, EdtHint};

/// The EDT opens a finish scope: its output event is a latch that fires
/// when the whole sub-graph has completed. Lives above the GUID property
/// bits, which share the same word.
pub const EDT_PROP_FINISH: u32 = 1 << 16;

/// EDT template metadata.
#[derive(Debug)]
pub struct TemplateRecord {
    ready: ReadyWord,
    pub func_id: u64,
    pub func_name: Option<String>,
    pub paramc: u32,
    pub depc: u32,
    pub hint: Option<EdtHint>,
}

impl TemplateRecord {
    pub fn new(func_id: u64, func_name: Option<String>, paramc: u32, depc: u32) -> TemplateRecord {
        TemplateRecord {
            ready: ReadyWord::new(),
            func_id,
            func_name,
            paramc,
            depc,
            hint: None,
        }
    }
}

impl GuidObject for TemplateRecord {
    fn ready_word(&self) -> &ReadyWord {
        &self.ready
    }
    fn kind(&self) -> GuidKind {
        GuidKind::EdtTemplate
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Affinity object: maps a GUID to a location.
#[derive(Debug)]
pub struct AffinityRecord {
    ready: ReadyWord,
    pub location: Location,
}

impl AffinityRecord {
    pub fn new(location: Location) -> AffinityRecord {
        AffinityRecord {
            ready: ReadyWord::new(),
            location,
        }
    }
}

impl GuidObject for AffinityRecord {
    fn ready_word(&self) -> &ReadyWord {
        &self.ready
    }
    fn kind(&self) -> GuidKind {
        GuidKind::Affinity
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Datablock metadata and storage.
pub struct DbRecord {
    ready: ReadyWord,
    pub size: u64,
    pub hint: DbHint,
    data: Mutex<Vec<u8>>,
    /// EDTs currently holding the block.
    acquirers: Mutex<Vec<Guid>>,
}

impl DbRecord {
    pub fn new(size: u64, hint: DbHint) -> DbRecord {
        DbRecord {
            ready: ReadyWord::new(),
            size,
            hint,
            data: Mutex::new(vec![0u8; size as usize]),
            acquirers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn write_back(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn acquire(&self, edt: Guid) {
        self.acquirers.lock().push(edt);
    }

    /// Returns false when the EDT did not hold the block.
    pub fn release(&self, edt: Guid) -> bool {
        let mut held = self.acquirers.lock();
        match held.iter().position(|g| *g == edt) {
            Some(idx) => {
                held.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn acquirer_count(&self) -> usize {
        self.acquirers.lock().len()
    }
}

impl std::fmt::Debug for DbRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRecord")
            .field("size", &self.size)
            .field("acquirers", &self.acquirer_count())
            .finish()
    }
}

impl GuidObject for DbRecord {
    fn ready_word(&self) -> &ReadyWord {
        &self.ready
    }
    fn kind(&self) -> GuidKind {
        GuidKind::Db
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
