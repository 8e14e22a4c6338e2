//! Runlevels
//!
//! Coarse lifecycle state shared by every component of a policy domain.
//! Transitions are multi-phase; a PD reaches phase P+1 of a runlevel only
//! after every component completed phase P.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Runlevel {
    ConfigParse = 0,
    NetworkOk = 1,
    PdOk = 2,
    MemoryOk = 3,
    GuidOk = 4,
    ComputeOk = 5,
    UserOk = 6,
}

impl Runlevel {
    pub const ALL: [Runlevel; 7] = [
        Runlevel::ConfigParse,
        Runlevel::NetworkOk,
        Runlevel::PdOk,
        Runlevel::MemoryOk,
        Runlevel::GuidOk,
        Runlevel::ComputeOk,
        Runlevel::UserOk,
    ];

    pub fn from_bits(bits: u8) -> Runlevel {
        match bits {
            0 => Runlevel::ConfigParse,
            1 => Runlevel::NetworkOk,
            2 => Runlevel::PdOk,
            3 => Runlevel::MemoryOk,
            4 => Runlevel::GuidOk,
            5 => Runlevel::ComputeOk,
            _ => Runlevel::UserOk,
        }
    }

    /// Next runlevel on the way up.
    pub fn up(&self) -> Option<Runlevel> {
        match self {
            Runlevel::UserOk => None,
            other => Some(Runlevel::from_bits(*other as u8 + 1)),
        }
    }

    /// Next runlevel on the way down.
    pub fn down(&self) -> Option<Runlevel> {
        match self {
            Runlevel::ConfigParse => None,
            other => Some(Runlevel::from_bits(*other as u8 - 1)),
        }
    }
}

bitflags::bitflags! {
    /// Properties qualifying a runlevel switch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RlProps: u32 {
        const REQUEST = 1 << 0;
        const RESPONSE = 1 << 1;
        const RELEASE = 1 << 2;
        const BRING_UP = 1 << 3;
        const TEAR_DOWN = 1 << 4;
        /// Hold at the phase boundary until the distributed barrier clears.
        const BARRIER = 1 << 5;
        /// The switch was triggered by a message, not the local lifecycle.
        const FROM_MSG = 1 << 6;
    }
}
