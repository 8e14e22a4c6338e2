//! The affinitized heuristic
//!
//! Get-work pops locally then steals: first the cached cursor, then the
//! sibling worker deques, and only for non-affinitized requesters the
//! neighbor deques. Give-work consults the EDT's hints to pick the
//! context covering the hinted location. An idle update serves parked
//! requesters and emits outbound work requests, affinitized first and
//! non-affinitized once every affinitized victim came back empty.

use crate::context::{InboundRequest, PendingRequest, ReplySlot, SchedContext};
use crate::error::{Result, SchedError};
use parking_lot::Mutex;
use std::sync::Arc;
use taskgrid_guid::{Guid, Location};
use taskgrid_proto::EdtHint;
use tracing::{debug, trace, warn};

/// Resolves hints and affinities at placement time.
pub trait PlacementOracle: Send + Sync {
    fn edt_hint(&self, edt: Guid) -> Option<EdtHint>;
    /// Location an affinity object maps to.
    fn affinity_location(&self, affinity: Guid) -> Option<Location>;
    /// DB_AFFINITY of the datablock in dependence slot `slot` of `edt`.
    fn slot_db_affinity(&self, edt: Guid, slot: u64) -> Option<Location>;
}

/// Why a send could not be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The peer is gone; remove it from the victim pool.
    Dead,
    /// Transient failure; retry on a later update.
    Other,
}

/// Outbound messaging surface the heuristic drives. Implementations must
/// not re-enter the heuristic from these calls.
pub trait WorkMsgSender: Send + Sync {
    fn send_work_request(
        &self,
        target: Location,
        discard_affinity: bool,
    ) -> std::result::Result<(), SendFailure>;

    /// Answer a parked remote work request; `None` is the empty reply.
    fn respond_work(&self, target: Location, msg_id: u64, edt: Option<Guid>);
}

/// Outcome of a get-work invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetWorkOutcome {
    Found(Guid),
    /// Answered empty immediately (affinitized remote request).
    Empty,
    /// Parked; a later update or notification completes it.
    Parked,
}

/// What a local compute worker should do next.
pub enum LocalWork {
    Edt(Guid),
    /// Park on the slot until work or shutdown arrives.
    Park(Arc<ReplySlot>),
    Shutdown,
}

/// Update flavors, invoked by an idle worker or at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateProp {
    Idle,
    Shutdown,
}

struct HeurState {
    contexts: Vec<SchedContext>,
    /// Number of local compute workers; their contexts come first.
    worker_count: usize,
    work_count: u64,
    in_pending_count: u32,
    pending_worker_count: u32,
    /// Victims still askable: [affinitized, non-affinitized].
    out_work_victims_available: [u32; 2],
    rr_worker: usize,
    rr_insert: usize,
    shutdown_mode: bool,
}

impl HeurState {
    fn context_index_of(&self, loc: Location) -> Option<usize> {
        self.contexts.iter().position(|c| c.location == loc)
    }

    /// Two-phase steal on behalf of `ctx_idx`. `allow_remote` opens the
    /// neighbor deques to the sweep.
    fn steal_for(&mut self, ctx_idx: usize, allow_remote: bool) -> Option<Guid> {
        if let Some(guid) = self.contexts[ctx_idx].deque.pop() {
            trace!(ctx = ctx_idx, %guid, "work from own deque");
            return Some(guid);
        }
        let is_child = self.contexts[ctx_idx].is_child;
        if !is_child && !allow_remote {
            // Affinitized neighbor request does not steal.
            return None;
        }
        // Cached cursor first; it probably had a successful steal.
        if let Some(cursor) = self.contexts[ctx_idx].steal_cursor {
            if cursor != ctx_idx {
                if let Some(guid) = self.contexts[cursor].deque.steal() {
                    return Some(guid);
                }
            }
        }
        let total = self.contexts.len();
        let workers = self.worker_count;
        if is_child {
            // Sweep the sibling worker deques.
            for i in 1..workers {
                let j = (ctx_idx + i) % workers;
                self.contexts[ctx_idx].steal_cursor = Some(j);
                if let Some(guid) = self.contexts[j].deque.steal() {
                    return Some(guid);
                }
            }
            if !allow_remote {
                return None;
            }
            // Fall back to work parked for the neighbors; the cursor is
            // deliberately not updated here.
            for j in workers..total {
                if let Some(guid) = self.contexts[j].deque.steal() {
                    return Some(guid);
                }
            }
            None
        } else {
            // Neighbor requester: other neighbor deques first.
            for i in 1..(total - workers) {
                let mut j = ctx_idx + i;
                if j >= total {
                    j = workers + (j - total);
                }
                self.contexts[ctx_idx].steal_cursor = Some(j);
                if let Some(guid) = self.contexts[j].deque.steal() {
                    return Some(guid);
                }
            }
            // Then the local worker deques.
            for j in 0..workers {
                if let Some(guid) = self.contexts[j].deque.steal() {
                    return Some(guid);
                }
            }
            None
        }
    }

    /// Context whose deque covers `loc`.
    fn place_for_location(&mut self, loc: Location, my_location: Location, from_idx: usize) -> usize {
        if loc == my_location {
            if self.contexts[from_idx].is_child {
                // Keep it where it became ready.
                from_idx
            } else {
                // Arrived from a neighbor: round-robin over the workers.
                let idx = self.rr_worker;
                self.rr_worker = (self.rr_worker + 1) % self.worker_count;
                idx
            }
        } else {
            // Flat cluster: every remote location is a direct neighbor.
            self.context_index_of(loc).unwrap_or(from_idx)
        }
    }
}

/// Per-PD scheduler heuristic. Entry points serialize on an internal
/// lock; contexts themselves need no further protection.
pub struct SchedulerHeuristic {
    my_location: Location,
    enforce_affinity: bool,
    state: Mutex<HeurState>,
}

impl SchedulerHeuristic {
    pub fn new(
        my_location: Location,
        worker_count: usize,
        neighbors: &[Location],
        enforce_affinity: bool,
    ) -> SchedulerHeuristic {
        assert!(worker_count >= 1);
        let mut contexts = Vec::with_capacity(worker_count + neighbors.len());
        for id in 0..worker_count {
            contexts.push(SchedContext::child(id, my_location));
        }
        for (i, loc) in neighbors.iter().enumerate() {
            contexts.push(SchedContext::neighbor(worker_count + i, *loc));
        }
        let neighbor_count = neighbors.len() as u32;
        SchedulerHeuristic {
            my_location,
            enforce_affinity,
            state: Mutex::new(HeurState {
                contexts,
                worker_count,
                work_count: 0,
                in_pending_count: 0,
                pending_worker_count: 0,
                out_work_victims_available: [neighbor_count, 0],
                rr_worker: 0,
                rr_insert: 0,
                shutdown_mode: false,
            }),
        }
    }

    pub fn my_location(&self) -> Location {
        self.my_location
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().worker_count
    }

    pub fn work_count(&self) -> u64 {
        self.state.lock().work_count
    }

    pub fn context_for_location(&self, loc: Location) -> Result<usize> {
        self.state
            .lock()
            .context_index_of(loc)
            .ok_or(SchedError::UnknownContext(loc))
    }

    pub fn reply_slot(&self, ctx_idx: usize) -> Arc<ReplySlot> {
        let state = self.state.lock();
        Arc::clone(
            state.contexts[ctx_idx]
                .reply_slot
                .as_ref()
                .expect("reply slot on a child context"),
        )
    }

    /// GET_WORK invocation on behalf of the peer at `ctx_idx`.
    pub fn get_work(
        &self,
        ctx_idx: usize,
        discard_affinity: bool,
        msg_id: Option<u64>,
    ) -> GetWorkOutcome {
        let mut s = self.state.lock();
        if s.shutdown_mode {
            warn!("work request received after shutdown was invoked");
            return GetWorkOutcome::Empty;
        }
        let discard = if self.enforce_affinity {
            false
        } else {
            discard_affinity
        };
        let is_child = s.contexts[ctx_idx].is_child;
        let allow_remote = if is_child {
            !self.enforce_affinity
        } else {
            discard
        };
        if s.work_count > 0 {
            if let Some(guid) = s.steal_for(ctx_idx, allow_remote) {
                s.work_count -= 1;
                debug!(ctx = ctx_idx, %guid, "GET_WORK found");
                return GetWorkOutcome::Found(guid);
            }
        }
        // The peer must not issue a second request before we answered.
        debug_assert!(s.contexts[ctx_idx].in_work_request.is_none());
        if discard || self.enforce_affinity {
            s.contexts[ctx_idx].in_work_request = Some(InboundRequest {
                msg_id,
                discard_affinity: discard,
            });
            if is_child {
                s.pending_worker_count += 1;
            }
            s.in_pending_count += 1;
            debug!(ctx = ctx_idx, "GET_WORK parked");
            GetWorkOutcome::Parked
        } else {
            // Affinitized remote request: answer empty now so the
            // requester can come back non-affinitized.
            debug!(ctx = ctx_idx, "GET_WORK affinitized miss, returning empty");
            GetWorkOutcome::Empty
        }
    }

    /// Non-parking probe: steal if anything is there, never park.
    pub fn try_get_work(&self, ctx_idx: usize, discard_affinity: bool) -> Option<Guid> {
        let mut s = self.state.lock();
        if s.shutdown_mode || s.work_count == 0 {
            return None;
        }
        let is_child = s.contexts[ctx_idx].is_child;
        let allow_remote = if is_child {
            !self.enforce_affinity
        } else {
            discard_affinity && !self.enforce_affinity
        };
        let found = s.steal_for(ctx_idx, allow_remote);
        if found.is_some() {
            s.work_count -= 1;
        }
        found
    }

    /// Get-work wrapper for a local compute worker.
    pub fn local_get_work(&self, ctx_idx: usize) -> LocalWork {
        match self.get_work(ctx_idx, true, None) {
            GetWorkOutcome::Found(guid) => LocalWork::Edt(guid),
            GetWorkOutcome::Parked => LocalWork::Park(self.reply_slot(ctx_idx)),
            GetWorkOutcome::Empty => LocalWork::Shutdown,
        }
    }

    /// NOTIFY_EDT_READY: either fresh work to place, or the empty answer
    /// to a work request we made (`edt == None`).
    pub fn notify_edt_ready(
        &self,
        from_idx: usize,
        edt: Option<Guid>,
        oracle: &dyn PlacementOracle,
    ) {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        let Some(edt) = edt else {
            // Empty response: the victim had nothing (affinitized miss,
            // or its shutdown drain). Either way it becomes eligible for
            // a later non-affinitized retry.
            let ctx = &mut s.contexts[from_idx];
            debug_assert!(matches!(
                ctx.out_work_request,
                PendingRequest::Affinitized | PendingRequest::NonAffinitized
            ));
            ctx.out_work_request = PendingRequest::AffinitizedFailed;
            s.out_work_victims_available[1] += 1;
            debug!(ctx = from_idx, "empty work response; victim demoted to non-affinitized");
            return;
        };
        debug_assert!(!s.shutdown_mode, "EDT became ready during shutdown");

        let from_is_child = s.contexts[from_idx].is_child;
        let mut insert_idx = from_idx;
        let mut hinted = false;
        if let Some(hint) = oracle.edt_hint(edt) {
            if let Some(aff) = hint.affinity {
                if let Some(loc) = oracle.affinity_location(aff) {
                    hinted = true;
                    insert_idx = s.place_for_location(loc, self.my_location, from_idx);
                }
            } else if let Some(slot) = hint.slot_max_access {
                if let Some(loc) = oracle.slot_db_affinity(edt, slot) {
                    hinted = true;
                    insert_idx = s.place_for_location(loc, self.my_location, from_idx);
                }
            }
        }
        if self.enforce_affinity && !hinted {
            if from_is_child {
                // Spread unhinted local work round-robin so it moves even
                // with stealing fenced off.
                insert_idx = s.rr_insert;
                s.rr_insert = (s.rr_insert + 1) % s.contexts.len();
            } else {
                // Work pulled from a neighbor was already placed once;
                // keep it on the local workers instead of re-exporting.
                insert_idx = s.rr_worker;
                s.rr_worker = (s.rr_worker + 1) % s.worker_count;
            }
        }

        s.contexts[insert_idx].deque.push(edt);
        s.work_count += 1;
        debug!(%edt, ctx = insert_idx, hinted, "EDT enqueued");

        if !from_is_child {
            // The source is a neighbor answering our work request.
            let ctx = &mut s.contexts[from_idx];
            debug_assert!(matches!(
                ctx.out_work_request,
                PendingRequest::Affinitized | PendingRequest::NonAffinitized
            ));
            ctx.out_work_request = PendingRequest::None;
            s.out_work_victims_available[0] += 1;
            // Work exists again: failed affinitized victims become
            // eligible for affinitized requests once more.
            if s.out_work_victims_available[1] > 0 {
                for ctx in s.contexts.iter_mut() {
                    if ctx.out_work_request == PendingRequest::AffinitizedFailed {
                        ctx.out_work_request = PendingRequest::None;
                        s.out_work_victims_available[1] -= 1;
                        s.out_work_victims_available[0] += 1;
                    }
                }
                debug_assert_eq!(s.out_work_victims_available[1], 0);
            }
        }
    }

    /// Periodic update from an idle worker, or the shutdown drain.
    pub fn update(&self, prop: UpdateProp, sender: &dyn WorkMsgSender) {
        match prop {
            UpdateProp::Idle => self.update_idle(sender),
            UpdateProp::Shutdown => self.update_shutdown(sender),
        }
    }

    fn update_idle(&self, sender: &dyn WorkMsgSender) {
        let mut s = self.state.lock();
        if s.shutdown_mode || s.in_pending_count == 0 {
            return;
        }
        debug_assert!(s.in_pending_count as usize <= s.contexts.len());

        // Serve parked requesters: workers first when work is scarce;
        // neighbors only when affinity is enforced (no steal risk) or
        // work exceeds the number of parked workers.
        for i in 0..s.contexts.len() {
            if s.work_count == 0 {
                break;
            }
            let is_child = s.contexts[i].is_child;
            if s.contexts[i].in_work_request.is_none() {
                continue;
            }
            if !(self.enforce_affinity
                || s.work_count > s.pending_worker_count as u64
                || is_child)
            {
                continue;
            }
            let allow_remote = !self.enforce_affinity;
            if let Some(guid) = s.steal_for(i, allow_remote) {
                s.work_count -= 1;
                let req = s.contexts[i].in_work_request.take().expect("checked above");
                s.in_pending_count -= 1;
                if is_child {
                    s.pending_worker_count -= 1;
                    s.contexts[i]
                        .reply_slot
                        .as_ref()
                        .expect("child context has a slot")
                        .fill(guid);
                } else {
                    sender.respond_work(
                        s.contexts[i].location,
                        req.msg_id.expect("remote request carries its id"),
                        Some(guid),
                    );
                }
            }
        }

        // Out of work with waiters parked: ask the victims, affinitized
        // pass first, then the non-affinitized retries.
        let steal_idx = if s.out_work_victims_available[0] == 0 { 1 } else { 0 };
        if s.work_count == 0
            && s.in_pending_count != 0
            && s.out_work_victims_available[steal_idx] != 0
        {
            for i in 0..s.contexts.len() {
                if s.out_work_victims_available[steal_idx] == 0 {
                    break;
                }
                if s.contexts[i].is_child || !s.contexts[i].can_accept_work_request {
                    continue;
                }
                let wanted = if steal_idx == 0 {
                    PendingRequest::None
                } else {
                    PendingRequest::AffinitizedFailed
                };
                if s.contexts[i].out_work_request != wanted {
                    continue;
                }
                let target = s.contexts[i].location;
                match sender.send_work_request(target, steal_idx == 1) {
                    Ok(()) => {
                        s.contexts[i].out_work_request = if steal_idx == 0 {
                            PendingRequest::Affinitized
                        } else {
                            PendingRequest::NonAffinitized
                        };
                        s.out_work_victims_available[steal_idx] -= 1;
                        debug!(%target, non_affinitized = steal_idx == 1, "work request sent");
                    }
                    Err(SendFailure::Dead) => {
                        warn!(%target, "victim is dead, removing from pool");
                        s.contexts[i].can_accept_work_request = false;
                        s.out_work_victims_available[steal_idx] -= 1;
                    }
                    Err(SendFailure::Other) => {
                        // Try again on a later update.
                    }
                }
            }
        }
    }

    fn update_shutdown(&self, sender: &dyn WorkMsgSender) {
        let mut s = self.state.lock();
        debug_assert!(!s.shutdown_mode);
        s.shutdown_mode = true;
        // Drain every parked requester with an empty reply.
        for i in 0..s.contexts.len() {
            let Some(req) = s.contexts[i].in_work_request.take() else {
                continue;
            };
            s.in_pending_count -= 1;
            if s.contexts[i].is_child {
                s.pending_worker_count -= 1;
                s.contexts[i]
                    .reply_slot
                    .as_ref()
                    .expect("child context has a slot")
                    .close();
            } else {
                sender.respond_work(
                    s.contexts[i].location,
                    req.msg_id.expect("remote request carries its id"),
                    None,
                );
            }
        }
    }

    /// Is a shutdown drain already done?
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct NoHints;
    impl PlacementOracle for NoHints {
        fn edt_hint(&self, _edt: Guid) -> Option<EdtHint> {
            None
        }
        fn affinity_location(&self, _affinity: Guid) -> Option<Location> {
            None
        }
        fn slot_db_affinity(&self, _edt: Guid, _slot: u64) -> Option<Location> {
            None
        }
    }

    /// Every EDT affinitized to one fixed location.
    struct PinnedTo(Location);
    impl PlacementOracle for PinnedTo {
        fn edt_hint(&self, _edt: Guid) -> Option<EdtHint> {
            Some(EdtHint {
                affinity: Some(Guid::from_raw(0xaff)),
                slot_max_access: None,
            })
        }
        fn affinity_location(&self, _affinity: Guid) -> Option<Location> {
            Some(self.0)
        }
        fn slot_db_affinity(&self, _edt: Guid, _slot: u64) -> Option<Location> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        requests: PlMutex<Vec<(Location, bool)>>,
        responses: PlMutex<Vec<(Location, u64, Option<Guid>)>>,
        dead: Option<Location>,
    }

    impl WorkMsgSender for RecordingSender {
        fn send_work_request(
            &self,
            target: Location,
            discard_affinity: bool,
        ) -> std::result::Result<(), SendFailure> {
            if self.dead == Some(target) {
                return Err(SendFailure::Dead);
            }
            self.requests.lock().push((target, discard_affinity));
            Ok(())
        }

        fn respond_work(&self, target: Location, msg_id: u64, edt: Option<Guid>) {
            self.responses.lock().push((target, msg_id, edt));
        }
    }

    fn guid(n: u64) -> Guid {
        Guid::from_raw(n)
    }

    fn sched(workers: usize, neighbors: &[Location], enforce: bool) -> SchedulerHeuristic {
        SchedulerHeuristic::new(Location(0), workers, neighbors, enforce)
    }

    #[test]
    fn own_work_is_popped_lifo_before_stealing() {
        let h = sched(2, &[], false);
        h.notify_edt_ready(0, Some(guid(1)), &NoHints);
        h.notify_edt_ready(0, Some(guid(2)), &NoHints);
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Found(guid(2)));
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Found(guid(1)));
    }

    #[test]
    fn workers_steal_fifo_from_siblings() {
        let h = sched(2, &[], false);
        h.notify_edt_ready(0, Some(guid(1)), &NoHints);
        h.notify_edt_ready(0, Some(guid(2)), &NoHints);
        // Worker 1 has nothing; it steals the oldest from worker 0.
        assert_eq!(h.get_work(1, true, None), GetWorkOutcome::Found(guid(1)));
    }

    #[test]
    fn hinted_work_lands_in_the_neighbor_context() {
        let neighbor = Location(1);
        let h = sched(1, &[neighbor], false);
        let oracle = PinnedTo(neighbor);
        h.notify_edt_ready(0, Some(guid(9)), &oracle);
        // An affinitized remote request from that neighbor gets it.
        let ctx = h.context_for_location(neighbor).unwrap();
        assert_eq!(h.get_work(ctx, false, Some(5)), GetWorkOutcome::Found(guid(9)));
    }

    #[test]
    fn workers_never_steal_neighbor_work_under_enforcement() {
        let neighbor = Location(1);
        let h = sched(1, &[neighbor], true);
        let oracle = PinnedTo(neighbor);
        h.notify_edt_ready(0, Some(guid(9)), &oracle);
        // The only work is parked for the neighbor; the local worker
        // parks rather than stealing it.
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Parked);
        assert_eq!(h.work_count(), 1);
    }

    #[test]
    fn affinitized_remote_miss_gets_an_immediate_empty() {
        let h = sched(1, &[Location(1)], false);
        let ctx = h.context_for_location(Location(1)).unwrap();
        assert_eq!(h.get_work(ctx, false, Some(7)), GetWorkOutcome::Empty);
    }

    #[test]
    fn steal_after_starvation_promotes_to_non_affinitized() {
        let victim = Location(1);
        let h = sched(1, &[victim], false);
        let sender = RecordingSender::default();

        // A local worker parks; the update sends an affinitized request.
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Parked);
        h.update(UpdateProp::Idle, &sender);
        assert_eq!(sender.requests.lock().as_slice(), &[(victim, false)]);

        // The victim answers empty; the next update retries non-affinitized.
        let ctx = h.context_for_location(victim).unwrap();
        h.notify_edt_ready(ctx, None, &NoHints);
        h.update(UpdateProp::Idle, &sender);
        assert_eq!(
            sender.requests.lock().as_slice(),
            &[(victim, false), (victim, true)]
        );

        // This time work arrives and the parked worker is served.
        let slot = h.reply_slot(0);
        h.notify_edt_ready(ctx, Some(guid(4)), &NoHints);
        h.update(UpdateProp::Idle, &sender);
        assert_eq!(slot.wait(), Some(guid(4)));
        assert_eq!(h.work_count(), 0);
    }

    #[test]
    fn dead_victims_leave_the_pool() {
        let victim = Location(1);
        let h = sched(1, &[victim], false);
        let sender = RecordingSender {
            dead: Some(victim),
            ..Default::default()
        };
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Parked);
        h.update(UpdateProp::Idle, &sender);
        assert!(sender.requests.lock().is_empty());
        // Nothing further to ask: the only victim is dead.
        h.update(UpdateProp::Idle, &sender);
        assert!(sender.requests.lock().is_empty());
    }

    #[test]
    fn parked_remote_request_is_served_by_update() {
        let neighbor = Location(1);
        let h = sched(1, &[neighbor], false);
        let sender = RecordingSender::default();
        let ctx = h.context_for_location(neighbor).unwrap();
        // Non-affinitized remote request parks while we are empty.
        assert_eq!(h.get_work(ctx, true, Some(11)), GetWorkOutcome::Parked);
        // Work shows up locally; serving prefers workers but none are
        // waiting, so the neighbor gets it.
        h.notify_edt_ready(0, Some(guid(8)), &NoHints);
        h.update(UpdateProp::Idle, &sender);
        assert_eq!(
            sender.responses.lock().as_slice(),
            &[(neighbor, 11, Some(guid(8)))]
        );
    }

    #[test]
    fn shutdown_drains_parked_requesters_with_empty_replies() {
        let neighbor = Location(1);
        let h = sched(1, &[neighbor], false);
        let sender = RecordingSender::default();
        let ctx = h.context_for_location(neighbor).unwrap();
        assert_eq!(h.get_work(ctx, true, Some(3)), GetWorkOutcome::Parked);
        let slot = h.reply_slot(0);
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Parked);

        h.update(UpdateProp::Shutdown, &sender);
        assert_eq!(sender.responses.lock().as_slice(), &[(neighbor, 3, None)]);
        assert_eq!(slot.wait(), None);
        // Further requests are refused.
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Empty);
        assert!(h.is_shutdown());
    }

    #[test]
    fn at_most_one_outbound_request_per_victim() {
        let victim = Location(1);
        let h = sched(2, &[victim], false);
        let sender = RecordingSender::default();
        assert_eq!(h.get_work(0, true, None), GetWorkOutcome::Parked);
        assert_eq!(h.get_work(1, true, None), GetWorkOutcome::Parked);
        // Two waiters, one victim: repeated updates never duplicate the
        // in-flight request.
        for _ in 0..5 {
            h.update(UpdateProp::Idle, &sender);
        }
        assert_eq!(sender.requests.lock().len(), 1);
    }

    #[test]
    fn every_enqueued_edt_is_counted_exactly_once() {
        let h = sched(2, &[Location(1)], false);
        for n in 1..=6usize {
            h.notify_edt_ready(n % 2, Some(guid(n as u64)), &NoHints);
        }
        assert_eq!(h.work_count(), 6);
        let mut popped = std::collections::HashSet::new();
        for ctx in 0..2 {
            loop {
                match h.try_get_work(ctx, true) {
                    Some(g) => {
                        assert!(popped.insert(g.raw()), "EDT surfaced twice");
                    }
                    None => break,
                }
            }
        }
        assert_eq!(popped.len(), 6);
        assert_eq!(h.work_count(), 0);
    }

    #[test]
    fn unhinted_work_spreads_round_robin_under_enforcement() {
        let h = sched(2, &[Location(1)], true);
        for n in 1..=3 {
            h.notify_edt_ready(0, Some(guid(n)), &NoHints);
        }
        // Three contexts, three EDTs: one each.
        let mut found = 0;
        for ctx in 0..3 {
            let mut s = h.state.lock();
            if s.contexts[ctx].deque.pop().is_some() {
                found += 1;
            }
            drop(s);
        }
        assert_eq!(found, 3);
    }
}
