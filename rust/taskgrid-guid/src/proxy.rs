//! Metadata proxy
//!
//! A proxy is the local stand-in for metadata whose home is another policy
//! domain. While the clone is in flight the proxy queues deferred requests;
//! registration closes the queue exactly once and hands the captured
//! waiters back to the caller for asynchronous re-submission.

use crate::error::{GuidError, Result};
use crate::record::GuidObject;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::OnceLock;

/// A queued request, re-issued when the metadata lands.
pub type DeferredAction = Box<dyn FnOnce() + Send + 'static>;

enum QueueState {
    /// No metadata yet; accepting registrants.
    Open(Vec<DeferredAction>),
    /// Metadata present; new requests are processed directly.
    Closed,
}

/// Local representent of remote metadata.
pub struct MdProxy {
    slot: OnceLock<Arc<dyn GuidObject>>,
    queue: Mutex<QueueState>,
}

impl MdProxy {
    pub fn new() -> MdProxy {
        MdProxy {
            slot: OnceLock::new(),
            queue: Mutex::new(QueueState::Open(Vec::new())),
        }
    }

    /// A proxy created for metadata that is already at hand (an object
    /// pushed to us by another PD). The queue is born closed.
    pub fn new_resolved(value: Arc<dyn GuidObject>) -> MdProxy {
        let proxy = MdProxy {
            slot: OnceLock::new(),
            queue: Mutex::new(QueueState::Closed),
        };
        let _ = proxy.slot.set(value);
        proxy
    }

    /// The metadata, once registered. Write-once.
    pub fn value(&self) -> Option<Arc<dyn GuidObject>> {
        self.slot.get().cloned()
    }

    /// Queue a request while the fetch is in flight.
    ///
    /// Returns the action back if the queue is already closed; the caller
    /// then processes it directly against the registered metadata.
    pub fn enqueue(&self, action: DeferredAction) -> std::result::Result<(), DeferredAction> {
        let mut q = self.queue.lock();
        match &mut *q {
            QueueState::Open(list) => {
                list.push(action);
                Ok(())
            }
            QueueState::Closed => Err(action),
        }
    }

    /// Bind the metadata and close the queue, returning every captured
    /// waiter in LIFO registration order. The Open -> Closed transition
    /// happens exactly once; a second registration is an error.
    pub fn register(&self, value: Arc<dyn GuidObject>) -> Result<Vec<DeferredAction>> {
        if self.slot.set(value).is_err() {
            return Err(GuidError::NotPermitted("metadata proxy already registered"));
        }
        let mut q = self.queue.lock();
        match std::mem::replace(&mut *q, QueueState::Closed) {
            QueueState::Open(mut list) => {
                // LIFO: the queue head is the most recent registrant.
                list.reverse();
                Ok(list)
            }
            QueueState::Closed => Err(GuidError::NotPermitted("metadata proxy queue already closed")),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl Default for MdProxy {
    fn default() -> Self {
        MdProxy::new()
    }
}

impl std::fmt::Debug for MdProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdProxy")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
