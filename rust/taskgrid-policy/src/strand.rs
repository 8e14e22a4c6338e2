//! Strands and actions
//!
//! The micro-task flavor of the message interface: an event resolves to a
//! message, a strand is the ordered list of continuation actions attached
//! to one event, and any worker may advance a strand once its event is
//! ready. The classic blocking calls are derived by waiting on the event.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use taskgrid_proto::PolicyMsg;

/// Processing class an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpKind {
    /// Advanced by computation workers.
    Work,
    /// Advanced by the communication worker.
    Comm,
}

struct EvtState {
    msg: Option<PolicyMsg>,
    ready: bool,
}

/// An event that resolves to (at most) one message.
pub struct PdEvent {
    state: Mutex<EvtState>,
    readiness: Condvar,
}

impl PdEvent {
    pub fn new() -> Arc<PdEvent> {
        Arc::new(PdEvent {
            state: Mutex::new(EvtState {
                msg: None,
                ready: false,
            }),
            readiness: Condvar::new(),
        })
    }

    pub fn with_msg(msg: PolicyMsg) -> Arc<PdEvent> {
        let evt = PdEvent::new();
        evt.state.lock().msg = Some(msg);
        evt
    }

    /// Resolve the event with `msg` and wake every waiter.
    pub fn resolve(&self, msg: Option<PolicyMsg>) {
        let mut s = self.state.lock();
        if msg.is_some() {
            s.msg = msg;
        }
        s.ready = true;
        self.readiness.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Classic blocking wait: park until the event resolves, then take
    /// the message out.
    pub fn wait(&self) -> Option<PolicyMsg> {
        let mut s = self.state.lock();
        while !s.ready {
            self.readiness.wait(&mut s);
        }
        s.msg.take()
    }

    /// Non-blocking take once ready.
    pub fn take_msg(&self) -> Option<PolicyMsg> {
        let mut s = self.state.lock();
        if s.ready {
            s.msg.take()
        } else {
            None
        }
    }
}

/// A continuation advancing a strand.
pub struct Action {
    pub np: NpKind,
    run: Box<dyn FnOnce(Option<PolicyMsg>) -> Option<PolicyMsg> + Send>,
}

impl Action {
    pub fn new(
        np: NpKind,
        run: impl FnOnce(Option<PolicyMsg>) -> Option<PolicyMsg> + Send + 'static,
    ) -> Action {
        Action {
            np,
            run: Box::new(run),
        }
    }
}

/// An ordered list of actions on one event.
pub struct Strand {
    event: Arc<PdEvent>,
    actions: Mutex<VecDeque<Action>>,
}

impl Strand {
    pub fn new(event: Arc<PdEvent>) -> Arc<Strand> {
        Arc::new(Strand {
            event,
            actions: Mutex::new(VecDeque::new()),
        })
    }

    pub fn event(&self) -> &Arc<PdEvent> {
        &self.event
    }

    pub fn enqueue(&self, action: Action) {
        self.actions.lock().push_back(action);
    }

    fn next_if(&self, np: NpKind) -> Option<Action> {
        let mut actions = self.actions.lock();
        if actions.front().map(|a| a.np) == Some(np) {
            actions.pop_front()
        } else {
            None
        }
    }

    pub fn is_drained(&self) -> bool {
        self.actions.lock().is_empty()
    }
}

/// All live strands of one policy domain.
#[derive(Default)]
pub struct StrandTable {
    strands: Mutex<Vec<Arc<Strand>>>,
}

impl StrandTable {
    pub fn new() -> StrandTable {
        StrandTable {
            strands: Mutex::new(Vec::new()),
        }
    }

    pub fn adopt(&self, strand: Arc<Strand>) {
        self.strands.lock().push(strand);
    }

    /// Advance every ready strand by at most one `np`-class action.
    /// Drained strands retire. Returns the number of actions run.
    pub fn process(&self, np: NpKind) -> usize {
        // Snapshot: actions may enqueue new strands.
        let snapshot: Vec<Arc<Strand>> = self.strands.lock().clone();
        let mut ran = 0;
        for strand in &snapshot {
            if !strand.event.is_ready() {
                continue;
            }
            while let Some(action) = strand.next_if(np) {
                let msg = strand.event.take_msg();
                let out = (action.run)(msg);
                strand.event.state.lock().msg = out;
                ran += 1;
            }
        }
        self.strands
            .lock()
            .retain(|s| !(s.event.is_ready() && s.is_drained()));
        ran
    }

    pub fn len(&self) -> usize {
        self.strands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.strands.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskgrid_guid::Location;
    use taskgrid_proto::{DepSatisfyBody, MsgBody};

    fn msg() -> PolicyMsg {
        PolicyMsg::request(
            MsgBody::DepSatisfy(DepSatisfyBody::default()),
            Location(0),
            Location(1),
        )
    }

    #[test]
    fn actions_run_only_after_the_event_is_ready() {
        let table = StrandTable::new();
        let event = PdEvent::new();
        let strand = Strand::new(Arc::clone(&event));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        strand.enqueue(Action::new(NpKind::Comm, move |m| {
            h.fetch_add(1, Ordering::SeqCst);
            m
        }));
        table.adopt(strand);

        assert_eq!(table.process(NpKind::Comm), 0);
        event.resolve(Some(msg()));
        assert_eq!(table.process(NpKind::Comm), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Drained and ready: retired.
        assert!(table.is_empty());
    }

    #[test]
    fn actions_of_the_other_class_are_left_queued() {
        let table = StrandTable::new();
        let event = PdEvent::with_msg(msg());
        event.resolve(None);
        let strand = Strand::new(Arc::clone(&event));
        strand.enqueue(Action::new(NpKind::Work, |m| m));
        table.adopt(Arc::clone(&strand));
        assert_eq!(table.process(NpKind::Comm), 0);
        assert!(!strand.is_drained());
        assert_eq!(table.process(NpKind::Work), 1);
    }

    #[test]
    fn blocking_wait_is_derived_from_the_event() {
        let event = PdEvent::new();
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(5));
        event.resolve(Some(msg()));
        assert!(waiter.join().unwrap().is_some());
    }
}
