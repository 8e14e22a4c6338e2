//! GUID bit layout
//!
//! A GUID packs `reserved | home | worker | kind | counter` into 64 bits.
//! The home field names the policy domain that owns the authoritative
//! metadata; the reserved bit marks user-minted (labeled) identifiers.
//! The counter is monotonically increasing within (home, worker) and must
//! never wrap during a program's lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the labeled/reserved marker.
pub const RESERVED_BITS: u32 = 1;
/// Width of the home-location field.
pub const HOME_BITS: u32 = 8;
/// Width of the worker-id field.
pub const WID_BITS: u32 = 4;
/// Width of the kind field.
pub const KIND_BITS: u32 = 5;
/// Width of the per-(home, worker) counter.
pub const COUNTER_BITS: u32 = 64 - RESERVED_BITS - HOME_BITS - WID_BITS - KIND_BITS;

const KIND_SHIFT: u32 = COUNTER_BITS;
const WID_SHIFT: u32 = KIND_SHIFT + KIND_BITS;
const HOME_SHIFT: u32 = WID_SHIFT + WID_BITS;
const RESERVED_SHIFT: u32 = HOME_SHIFT + HOME_BITS;

/// Highest counter value representable in a GUID.
pub const MAX_COUNTER: u64 = (1u64 << COUNTER_BITS) - 1;
/// Number of distinct home locations representable in a GUID.
pub const MAX_LOCATIONS: u64 = 1u64 << HOME_BITS;
/// Number of distinct worker ids representable in a GUID.
pub const MAX_WORKERS: u64 = 1u64 << WID_BITS;

const fn field_mask(bits: u32, shift: u32) -> u64 {
    (((1u64 << bits) - 1) as u64) << shift
}

/// A policy-domain location.
///
/// Identity mapping between location and the home id stored in a GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location(pub u32);

impl Location {
    /// Sentinel for "no location decided yet".
    pub const UNDEFINED: Location = Location(u32::MAX);

    pub fn is_undefined(&self) -> bool {
        *self == Location::UNDEFINED
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "pd:?")
        } else {
            write!(f, "pd:{}", self.0)
        }
    }
}

/// Kind of the object a GUID names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum GuidKind {
    Unknown = 0,
    Allocator = 1,
    Db = 2,
    Edt = 3,
    EdtTemplate = 4,
    EventOnce = 5,
    EventSticky = 6,
    EventLatch = 7,
    EventChannel = 8,
    Policy = 9,
    Worker = 10,
    Affinity = 11,
    GuidMap = 12,
    MdProxy = 13,
    Comm = 14,
}

impl GuidKind {
    pub fn from_bits(bits: u8) -> GuidKind {
        match bits {
            1 => GuidKind::Allocator,
            2 => GuidKind::Db,
            3 => GuidKind::Edt,
            4 => GuidKind::EdtTemplate,
            5 => GuidKind::EventOnce,
            6 => GuidKind::EventSticky,
            7 => GuidKind::EventLatch,
            8 => GuidKind::EventChannel,
            9 => GuidKind::Policy,
            10 => GuidKind::Worker,
            11 => GuidKind::Affinity,
            12 => GuidKind::GuidMap,
            13 => GuidKind::MdProxy,
            14 => GuidKind::Comm,
            _ => GuidKind::Unknown,
        }
    }

    /// True for every event sub-kind.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            GuidKind::EventOnce
                | GuidKind::EventSticky
                | GuidKind::EventLatch
                | GuidKind::EventChannel
        )
    }

    /// Events that do not survive their first satisfaction.
    pub fn is_non_persistent_event(&self) -> bool {
        matches!(self, GuidKind::EventOnce | GuidKind::EventLatch)
    }
}

/// Cluster-unique object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(u64);

impl Guid {
    /// The null GUID.
    pub const NULL: Guid = Guid(0);

    pub fn from_raw(raw: u64) -> Guid {
        Guid(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Pack the GUID fields. Debug builds check field ranges.
    pub fn pack(reserved: bool, home: Location, wid: u16, kind: GuidKind, counter: u64) -> Guid {
        debug_assert!((home.0 as u64) < MAX_LOCATIONS, "home location overflows GUID field");
        debug_assert!((wid as u64) < MAX_WORKERS, "worker id overflows GUID field");
        debug_assert!(counter <= MAX_COUNTER, "GUID counter overflows");
        let mut raw = counter;
        raw |= (kind as u64) << KIND_SHIFT;
        raw |= (wid as u64) << WID_SHIFT;
        raw |= (home.0 as u64) << HOME_SHIFT;
        if reserved {
            raw |= 1u64 << RESERVED_SHIFT;
        }
        Guid(raw)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// True for labeled (user-minted) GUIDs.
    pub fn is_reserved(&self) -> bool {
        self.0 & field_mask(RESERVED_BITS, RESERVED_SHIFT) != 0
    }

    /// Home policy domain: the only PD allowed to invalidate the object.
    pub fn home(&self) -> Location {
        Location(((self.0 & field_mask(HOME_BITS, HOME_SHIFT)) >> HOME_SHIFT) as u32)
    }

    /// Worker that allocated this GUID.
    pub fn worker(&self) -> u16 {
        ((self.0 & field_mask(WID_BITS, WID_SHIFT)) >> WID_SHIFT) as u16
    }

    pub fn kind(&self) -> GuidKind {
        GuidKind::from_bits(((self.0 & field_mask(KIND_BITS, KIND_SHIFT)) >> KIND_SHIFT) as u8)
    }

    pub fn counter(&self) -> u64 {
        self.0 & field_mask(COUNTER_BITS, 0)
    }
}

impl Default for Guid {
    fn default() -> Guid {
        Guid::NULL
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:#018x})", self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
