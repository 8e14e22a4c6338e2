//! Runlevel lifecycle
//!
//! Bring-up walks the runlevels from CONFIG_PARSE to USER_OK, one phase
//! at a time; tear-down descends them. USER_OK tear-down takes three
//! phases so the distributed shutdown barrier has a boundary to hold at:
//! stop user intake, drain the scheduler, then notify the neighbors and
//! wait for `neighborCount + 1` acknowledgements.

use taskgrid_proto::{RlProps, Runlevel};

/// Number of bring-up phases of a runlevel.
pub fn phases_up(_rl: Runlevel) -> u32 {
    1
}

/// Number of tear-down phases of a runlevel.
pub fn phases_down(rl: Runlevel) -> u32 {
    match rl {
        // Distributed shutdown needs the extra boundaries.
        Runlevel::UserOk => 3,
        _ => 1,
    }
}

/// Progress of the lifecycle machine of one policy domain.
#[derive(Debug, Clone, Copy)]
pub struct RlSwitch {
    pub runlevel: Runlevel,
    pub next_phase: u32,
    pub properties: RlProps,
}

impl RlSwitch {
    pub fn at_boot() -> RlSwitch {
        RlSwitch {
            runlevel: Runlevel::ConfigParse,
            next_phase: 0,
            properties: RlProps::REQUEST | RlProps::BRING_UP,
        }
    }

    pub fn is_tearing_down(&self) -> bool {
        self.properties.contains(RlProps::TEAR_DOWN)
    }

    /// Record completion of one phase; returns the next (runlevel, phase)
    /// or None when the walk in the current direction is over.
    pub fn advance(&mut self) -> Option<(Runlevel, u32)> {
        if self.is_tearing_down() {
            if self.next_phase + 1 < phases_down(self.runlevel) {
                self.next_phase += 1;
            } else {
                self.runlevel = self.runlevel.down()?;
                self.next_phase = 0;
            }
        } else if self.next_phase + 1 < phases_up(self.runlevel) {
            self.next_phase += 1;
        } else {
            self.runlevel = self.runlevel.up()?;
            self.next_phase = 0;
        }
        Some((self.runlevel, self.next_phase))
    }

    /// Flip the machine into tear-down at USER_OK.
    pub fn begin_teardown(&mut self) {
        self.runlevel = Runlevel::UserOk;
        self.next_phase = 0;
        self.properties = RlProps::REQUEST | RlProps::TEAR_DOWN;
    }
}
