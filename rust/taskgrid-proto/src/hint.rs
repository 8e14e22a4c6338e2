//! Runtime hints
//!
//! User-settable placement hints observed by the scheduler heuristic.
//! Hints travel as a fixed 32-byte section of create messages.

use serde::{Deserialize, Serialize};
use taskgrid_guid::{Guid, Location};

/// Validity bits for [`RuntimeHints`].
pub mod mask {
    /// `EDT_AFFINITY` is set.
    pub const EDT_AFFINITY: u64 = 1 << 0;
    /// `EDT_SLOT_MAX_ACCESS` is set.
    pub const EDT_SLOT_MAX_ACCESS: u64 = 1 << 1;
    /// `DB_AFFINITY` is set.
    pub const DB_AFFINITY: u64 = 1 << 2;
}

/// Wire representation of the hint block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHints {
    pub mask: u64,
    pub edt_affinity: u64,
    pub slot_max_access: u64,
    pub db_affinity: u64,
}

impl RuntimeHints {
    pub const WIRE_SIZE: usize = 32;

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }
}

/// Hints attached to an EDT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdtHint {
    /// Affinity object the EDT should run close to.
    pub affinity: Option<Guid>,
    /// Dependence slot whose datablock placement dominates.
    pub slot_max_access: Option<u64>,
}

impl EdtHint {
    pub fn is_empty(&self) -> bool {
        self.affinity.is_none() && self.slot_max_access.is_none()
    }

    pub fn to_wire(&self) -> RuntimeHints {
        let mut w = RuntimeHints::default();
        if let Some(aff) = self.affinity {
            w.mask |= mask::EDT_AFFINITY;
            w.edt_affinity = aff.raw();
        }
        if let Some(slot) = self.slot_max_access {
            w.mask |= mask::EDT_SLOT_MAX_ACCESS;
            w.slot_max_access = slot;
        }
        w
    }

    pub fn from_wire(w: &RuntimeHints) -> EdtHint {
        EdtHint {
            affinity: (w.mask & mask::EDT_AFFINITY != 0).then(|| Guid::from_raw(w.edt_affinity)),
            slot_max_access: (w.mask & mask::EDT_SLOT_MAX_ACCESS != 0).then_some(w.slot_max_access),
        }
    }
}

/// Hints attached to a datablock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbHint {
    /// Location whose memory should back the block.
    pub affinity: Option<Location>,
}

impl DbHint {
    pub fn is_empty(&self) -> bool {
        self.affinity.is_none()
    }

    pub fn to_wire(&self) -> RuntimeHints {
        let mut w = RuntimeHints::default();
        if let Some(loc) = self.affinity {
            w.mask |= mask::DB_AFFINITY;
            w.db_affinity = loc.0 as u64;
        }
        w
    }

    pub fn from_wire(w: &RuntimeHints) -> DbHint {
        DbHint {
            affinity: (w.mask & mask::DB_AFFINITY != 0).then(|| Location(w.db_affinity as u32)),
        }
    }
}
