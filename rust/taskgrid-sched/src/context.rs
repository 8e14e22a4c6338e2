//! Scheduler contexts
//!
//! One context per peer: each local compute worker and each neighbor
//! policy domain. At most one outbound and one inbound work request can
//! be pending per context at any time.

use crate::deque::WorkDeque;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use taskgrid_guid::{Guid, Location};

/// State of the work request we sent to a victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    /// No request was sent.
    None,
    /// An affinitized request is in flight.
    Affinitized,
    /// An affinitized request came back empty; eligible for a
    /// non-affinitized retry.
    AffinitizedFailed,
    /// A non-affinitized request is in flight.
    NonAffinitized,
}

/// Parking slot a local compute worker blocks on when no work is found.
pub struct ReplySlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

enum SlotState {
    Empty,
    Ready(Guid),
    Closed,
}

impl ReplySlot {
    pub fn new() -> Arc<ReplySlot> {
        Arc::new(ReplySlot {
            state: Mutex::new(SlotState::Empty),
            ready: Condvar::new(),
        })
    }

    /// Hand the sleeping worker an EDT and wake it.
    pub fn fill(&self, guid: Guid) {
        let mut state = self.state.lock();
        *state = SlotState::Ready(guid);
        self.ready.notify_one();
    }

    /// Wake the worker empty-handed (shutdown drain).
    pub fn close(&self) {
        let mut state = self.state.lock();
        *state = SlotState::Closed;
        self.ready.notify_one();
    }

    /// Park until filled or closed. Returns the EDT, or None on close.
    pub fn wait(&self) -> Option<Guid> {
        let mut state = self.state.lock();
        loop {
            match *state {
                SlotState::Ready(guid) => {
                    *state = SlotState::Empty;
                    return Some(guid);
                }
                SlotState::Closed => return None,
                SlotState::Empty => self.ready.wait(&mut state),
            }
        }
    }
}

/// An inbound work request parked at this context.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest {
    /// Correlation id to answer with (None for a local worker).
    pub msg_id: Option<u64>,
    pub discard_affinity: bool,
}

/// Per-peer bookkeeping.
pub struct SchedContext {
    pub id: usize,
    pub location: Location,
    pub deque: WorkDeque,
    /// Index of the context last stolen from successfully.
    pub steal_cursor: Option<usize>,
    pub out_work_request: PendingRequest,
    pub in_work_request: Option<InboundRequest>,
    pub can_accept_work_request: bool,
    /// Local compute worker (reports here for the shutdown protocol).
    pub is_child: bool,
    /// Parking slot; present on child contexts only.
    pub reply_slot: Option<Arc<ReplySlot>>,
}

impl SchedContext {
    pub fn child(id: usize, location: Location) -> SchedContext {
        SchedContext {
            id,
            location,
            deque: WorkDeque::new(),
            steal_cursor: None,
            out_work_request: PendingRequest::None,
            in_work_request: None,
            can_accept_work_request: false,
            is_child: true,
            reply_slot: Some(ReplySlot::new()),
        }
    }

    pub fn neighbor(id: usize, location: Location) -> SchedContext {
        SchedContext {
            id,
            location,
            deque: WorkDeque::new(),
            steal_cursor: None,
            out_work_request: PendingRequest::None,
            in_work_request: None,
            can_accept_work_request: true,
            is_child: false,
            reply_slot: None,
        }
    }
}
