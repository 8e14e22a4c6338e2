//! Work deques
//!
//! Chase-Lev deque of ready EDT GUIDs: the owner pushes and pops at the
//! tail (LIFO), thieves steal from the head (FIFO). All owner-side calls
//! are funnelled through the heuristic's single thread of control.

use crossbeam_deque::{Steal, Stealer, Worker};
use taskgrid_guid::Guid;

pub struct WorkDeque {
    worker: Worker<Guid>,
    stealer: Stealer<Guid>,
}

impl WorkDeque {
    pub fn new() -> WorkDeque {
        let worker = Worker::new_lifo();
        let stealer = worker.stealer();
        WorkDeque { worker, stealer }
    }

    /// Enqueue at the tail.
    pub fn push(&self, guid: Guid) {
        self.worker.push(guid);
    }

    /// Owner pop, LIFO.
    pub fn pop(&self) -> Option<Guid> {
        self.worker.pop()
    }

    /// Thief steal, FIFO from the head.
    pub fn steal(&self) -> Option<Guid> {
        loop {
            match self.stealer.steal() {
                Steal::Success(guid) => return Some(guid),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.worker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }
}

impl Default for WorkDeque {
    fn default() -> Self {
        WorkDeque::new()
    }
}

impl std::fmt::Debug for WorkDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkDeque").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u64) -> Guid {
        Guid::from_raw(n)
    }

    #[test]
    fn owner_pops_lifo() {
        let d = WorkDeque::new();
        d.push(guid(1));
        d.push(guid(2));
        d.push(guid(3));
        assert_eq!(d.pop(), Some(guid(3)));
        assert_eq!(d.pop(), Some(guid(2)));
        assert_eq!(d.pop(), Some(guid(1)));
        assert_eq!(d.pop(), None);
    }

    #[test]
    fn thieves_steal_fifo() {
        let d = WorkDeque::new();
        d.push(guid(1));
        d.push(guid(2));
        d.push(guid(3));
        assert_eq!(d.steal(), Some(guid(1)));
        assert_eq!(d.steal(), Some(guid(2)));
        // Owner still gets the newest.
        assert_eq!(d.pop(), Some(guid(3)));
    }
}
