//! EDT records
//!
//! An event-driven task is executable exactly when every dependence slot
//! has been satisfied. The record tracks the satisfaction frontier, the
//! resolved payload of each slot, and the datablocks acquired outside the
//! declared dependence list.

use parking_lot::Mutex;
use std::any::Any;
use taskgrid_guid::{Guid, GuidKind, GuidObject, ReadyWord};
use taskgrid_proto::EdtHint;

/// Whether this record is the authoritative copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdState {
    Master,
    Ghost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdtState {
    Created,
    Ready,
    Running,
    Done,
}

struct Slots {
    satisfied_count: u32,
    /// Lowest slot index not yet satisfied.
    frontier_slot: u32,
    /// Payload per slot, filled as satisfactions land.
    resolved_deps: Vec<Option<Guid>>,
    state: EdtState,
}

/// Task metadata.
pub struct EdtRecord {
    ready: ReadyWord,
    pub template: Guid,
    pub paramc: u32,
    pub paramv: Vec<u64>,
    pub depc: u32,
    pub hint: Option<EdtHint>,
    pub output_event: Guid,
    pub parent_latch: Guid,
    pub properties: u32,
    pub md_state: MdState,
    slots: Mutex<Slots>,
    /// Datablocks acquired outside the declared dependences.
    unk_dbs: Mutex<Vec<Guid>>,
}

impl EdtRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        template: Guid,
        paramc: u32,
        paramv: Vec<u64>,
        depc: u32,
        hint: Option<EdtHint>,
        output_event: Guid,
        parent_latch: Guid,
        properties: u32,
    ) -> EdtRecord {
        EdtRecord {
            ready: ReadyWord::new(),
            template,
            paramc,
            paramv,
            depc,
            hint,
            output_event,
            parent_latch,
            properties,
            md_state: MdState::Master,
            slots: Mutex::new(Slots {
                satisfied_count: 0,
                frontier_slot: 0,
                resolved_deps: vec![None; depc as usize],
                state: EdtState::Created,
            }),
            unk_dbs: Mutex::new(Vec::new()),
        }
    }

    /// Satisfy dependence slot `slot` with `payload`. Returns true when
    /// this satisfaction makes the EDT executable.
    pub fn satisfy_slot(&self, slot: u32, payload: Guid) -> crate::error::Result<bool> {
        let mut s = self.slots.lock();
        if slot >= self.depc {
            return Err(crate::error::PolicyError::Invalid("dependence slot out of range"));
        }
        if s.resolved_deps[slot as usize].is_some() {
            return Err(crate::error::PolicyError::NotPermitted(
                "dependence slot satisfied twice",
            ));
        }
        s.resolved_deps[slot as usize] = Some(payload);
        s.satisfied_count += 1;
        while (s.frontier_slot as usize) < s.resolved_deps.len()
            && s.resolved_deps[s.frontier_slot as usize].is_some()
        {
            s.frontier_slot += 1;
        }
        let ready = s.satisfied_count == self.depc;
        if ready {
            s.state = EdtState::Ready;
        }
        Ok(ready)
    }

    /// Executable iff every slot is satisfied.
    pub fn is_ready(&self) -> bool {
        let s = self.slots.lock();
        s.satisfied_count == self.depc
    }

    pub fn state(&self) -> EdtState {
        self.slots.lock().state
    }

    pub fn set_state(&self, state: EdtState) {
        self.slots.lock().state = state;
    }

    pub fn satisfied_count(&self) -> u32 {
        self.slots.lock().satisfied_count
    }

    pub fn frontier_slot(&self) -> u32 {
        self.slots.lock().frontier_slot
    }

    /// Snapshot of the resolved dependence payloads.
    pub fn resolved_deps(&self) -> Vec<Option<Guid>> {
        self.slots.lock().resolved_deps.clone()
    }

    pub fn note_unknown_db(&self, db: Guid) {
        self.unk_dbs.lock().push(db);
    }

    pub fn forget_unknown_db(&self, db: Guid) -> bool {
        let mut dbs = self.unk_dbs.lock();
        match dbs.iter().position(|g| *g == db) {
            Some(idx) => {
                dbs.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn unknown_db_count(&self) -> usize {
        self.unk_dbs.lock().len()
    }

    /// The EDT opens a finish scope.
    pub fn is_finish(&self) -> bool {
        self.properties & super::EDT_PROP_FINISH != 0
    }
}

impl std::fmt::Debug for EdtRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdtRecord")
            .field("template", &self.template)
            .field("depc", &self.depc)
            .field("satisfied", &self.satisfied_count())
            .field("state", &self.state())
            .finish()
    }
}

impl GuidObject for EdtRecord {
    fn ready_word(&self) -> &ReadyWord {
        &self.ready
    }
    fn kind(&self) -> GuidKind {
        GuidKind::Edt
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
