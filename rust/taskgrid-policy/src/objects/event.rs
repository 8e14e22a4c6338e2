//! Event records
//!
//! Four variants: ONCE fires then disappears, STICKY persists its payload,
//! LATCH counts increments and decrements and fires at zero, CHANNEL pairs
//! satisfactions with waiters in FIFO order. Satisfaction resolves to a
//! delivery list; the dispatcher routes each delivery, locally or not.

use crate::error::{PolicyError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use taskgrid_guid::{Guid, GuidKind, GuidObject, ReadyWord};

/// Latch slot receiving decrements.
pub const LATCH_DECR_SLOT: u32 = 0;
/// Latch slot receiving increments.
pub const LATCH_INCR_SLOT: u32 = 1;

/// A dependence registered on an event: destination object and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub dest: Guid,
    pub slot: u32,
}

enum EventState {
    Once {
        waiters: Vec<Waiter>,
        fired: bool,
    },
    Sticky {
        waiters: Vec<Waiter>,
        payload: Option<Guid>,
    },
    Latch {
        waiters: Vec<Waiter>,
        count: i64,
        incr_total: u64,
        decr_total: u64,
    },
    Channel {
        satisfactions: VecDeque<Guid>,
        waiters: VecDeque<Waiter>,
    },
}

/// A synchronization object.
pub struct EventRecord {
    ready: ReadyWord,
    kind: GuidKind,
    state: Mutex<EventState>,
}

impl EventRecord {
    pub fn new(kind: GuidKind, initial_latch_count: i64) -> Result<EventRecord> {
        let state = match kind {
            GuidKind::EventOnce => EventState::Once {
                waiters: Vec::new(),
                fired: false,
            },
            GuidKind::EventSticky => EventState::Sticky {
                waiters: Vec::new(),
                payload: None,
            },
            GuidKind::EventLatch => EventState::Latch {
                waiters: Vec::new(),
                count: initial_latch_count,
                incr_total: initial_latch_count.max(0) as u64,
                decr_total: 0,
            },
            GuidKind::EventChannel => EventState::Channel {
                satisfactions: VecDeque::new(),
                waiters: VecDeque::new(),
            },
            _ => return Err(PolicyError::Invalid("not an event kind")),
        };
        Ok(EventRecord {
            ready: ReadyWord::new(),
            kind,
            state: Mutex::new(state),
        })
    }

    /// Register a dependence. Returns deliveries that fire immediately
    /// (sticky already satisfied, channel with a queued satisfaction).
    pub fn register_waiter(&self, waiter: Waiter) -> Result<Vec<(Waiter, Guid)>> {
        let mut state = self.state.lock();
        match &mut *state {
            EventState::Once { waiters, fired } => {
                if *fired {
                    return Err(PolicyError::NotPermitted(
                        "once event already fired",
                    ));
                }
                waiters.push(waiter);
                Ok(Vec::new())
            }
            EventState::Sticky { waiters, payload } => match payload {
                Some(p) => Ok(vec![(waiter, *p)]),
                None => {
                    waiters.push(waiter);
                    Ok(Vec::new())
                }
            },
            EventState::Latch { waiters, .. } => {
                waiters.push(waiter);
                Ok(Vec::new())
            }
            EventState::Channel {
                satisfactions,
                waiters,
            } => match satisfactions.pop_front() {
                Some(p) => Ok(vec![(waiter, p)]),
                None => {
                    waiters.push_back(waiter);
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Satisfy the event on `slot` with `payload`. Returns the deliveries
    /// this satisfaction releases.
    pub fn satisfy(&self, slot: u32, payload: Guid) -> Result<Vec<(Waiter, Guid)>> {
        let mut state = self.state.lock();
        match &mut *state {
            EventState::Once { waiters, fired } => {
                if *fired {
                    return Err(PolicyError::NotPermitted("once event satisfied twice"));
                }
                *fired = true;
                Ok(waiters.drain(..).map(|w| (w, payload)).collect())
            }
            EventState::Sticky {
                waiters,
                payload: stored,
            } => {
                if stored.is_some() {
                    // Sticky satisfaction is idempotent.
                    return Ok(Vec::new());
                }
                *stored = Some(payload);
                Ok(waiters.drain(..).map(|w| (w, payload)).collect())
            }
            EventState::Latch {
                waiters,
                count,
                incr_total,
                decr_total,
            } => {
                match slot {
                    LATCH_INCR_SLOT => {
                        *count += 1;
                        *incr_total += 1;
                    }
                    LATCH_DECR_SLOT => {
                        *count -= 1;
                        *decr_total += 1;
                    }
                    _ => return Err(PolicyError::Invalid("latch slot out of range")),
                }
                if *count == 0 {
                    Ok(waiters.drain(..).map(|w| (w, Guid::NULL)).collect())
                } else {
                    Ok(Vec::new())
                }
            }
            EventState::Channel {
                satisfactions,
                waiters,
            } => match waiters.pop_front() {
                Some(w) => Ok(vec![(w, payload)]),
                None => {
                    satisfactions.push_back(payload);
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Payload of a satisfied sticky event.
    pub fn sticky_payload(&self) -> Option<Guid> {
        match &*self.state.lock() {
            EventState::Sticky { payload, .. } => *payload,
            _ => None,
        }
    }

    /// Once events disappear after firing.
    pub fn is_spent(&self) -> bool {
        match &*self.state.lock() {
            EventState::Once { fired, .. } => *fired,
            _ => false,
        }
    }

    /// (increments, decrements) seen by a latch.
    pub fn latch_totals(&self) -> Option<(u64, u64)> {
        match &*self.state.lock() {
            EventState::Latch {
                incr_total,
                decr_total,
                ..
            } => Some((*incr_total, *decr_total)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecord").field("kind", &self.kind).finish()
    }
}

impl GuidObject for EventRecord {
    fn ready_word(&self) -> &ReadyWord {
        &self.ready
    }
    fn kind(&self) -> GuidKind {
        self.kind
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
