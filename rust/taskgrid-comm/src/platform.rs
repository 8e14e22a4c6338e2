//! Communication platform
//!
//! Marshalls outgoing messages, assigns correlation ids, tracks handles
//! and drives the receive side under one of two strategies: probe-based
//! (query the size, then receive into a right-sized buffer) or pre-post
//! (fixed-size slots, arbitrary sizes rejected).

use crate::error::{CommError, Result};
use crate::fabric::{Fabric, WireMsg};
use crate::handles::{IncomingHandle, OutgoingHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgrid_guid::Location;
use taskgrid_proto::{
    marshall, msg_sizes, unmarshall, MarshallFlags, MarshallMode, PolicyMsg, SendProps,
    SEND_ANY_ID,
};
use tracing::{debug, trace, warn};

/// Receive strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStrategy {
    /// Probe for size, receive into a right-sized buffer.
    Probe,
    /// Pre-posted fixed-size slots; a message larger than the slot is a
    /// protocol violation.
    PrePost,
}

/// Result of one poll pass.
#[derive(Debug)]
pub enum Polled {
    /// Response matched against an awaited request.
    Response(PolicyMsg),
    /// Unsolicited incoming message (request or asynchronous response).
    Unsolicited(PolicyMsg),
    /// Nothing ready.
    None {
        outgoing_empty: bool,
        incoming_empty: bool,
    },
}

/// Per-PD communication endpoint. The communication worker owns it; no
/// other thread touches the handle lists.
pub struct CommPlatform {
    fabric: Arc<dyn Fabric>,
    my_location: Location,
    strategy: RecvStrategy,
    max_msg_size: usize,
    comm_id: AtomicU64,
    outgoing: Vec<OutgoingHandle>,
    incoming: Vec<IncomingHandle>,
}

impl CommPlatform {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        my_location: Location,
        strategy: RecvStrategy,
        max_msg_size: usize,
    ) -> CommPlatform {
        CommPlatform {
            fabric,
            my_location,
            strategy,
            max_msg_size,
            comm_id: AtomicU64::new(1),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    pub fn my_location(&self) -> Location {
        self.my_location
    }

    fn wire_flags() -> MarshallFlags {
        MarshallFlags::DBPTR | MarshallFlags::NSADDR
    }

    /// Send `msg` to `target`.
    ///
    /// Request messages get a fresh correlation id (returned and stored in
    /// `msg.msg_id`); asynchronous responses are tagged `SEND_ANY_ID` so
    /// the receiver does not match them against a request; regular
    /// responses keep the id the requester is waiting on.
    pub fn send_message(
        &mut self,
        target: Location,
        msg: &mut PolicyMsg,
        props: SendProps,
    ) -> Result<u64> {
        let (base, payload) = msg_sizes(msg, Self::wire_flags());
        let full_size = taskgrid_proto::HEADER_SIZE + base + payload;
        if full_size > self.max_msg_size {
            return Err(CommError::TooLarge {
                size: full_size,
                bound: self.max_msg_size,
            });
        }

        let comm_id = self.comm_id.fetch_add(1, Ordering::Relaxed);
        if msg.is_request() {
            msg.msg_id = comm_id;
        } else if props.contains(SendProps::ASYNC_MSG) {
            msg.msg_id = SEND_ANY_ID;
        }

        // A response is tagged with the id its requester waits on; requests
        // travel as unsolicited traffic.
        let tag = if msg.is_response() {
            msg.msg_id
        } else {
            SEND_ANY_ID
        };

        let buffer = marshall(msg, MarshallMode::FullCopy, Self::wire_flags())?;
        debug_assert!(buffer.addl.is_none());
        let bytes = buffer.main;
        debug!(
            dest = %target, kind = ?msg.kind(), msg_id = msg.msg_id, tag, len = bytes.len(),
            "sending message"
        );

        // Only requests await a response; responses echo the two-way
        // flag of their request and must not be tracked.
        let two_way =
            msg.is_request() && msg.expects_response() && !props.contains(SendProps::ASYNC_MSG);
        let ticket = self
            .fabric
            .send(WireMsg::new(self.my_location, target, tag, bytes))?;
        self.outgoing.push(OutgoingHandle {
            msg_id: msg.msg_id,
            target,
            ticket,
            two_way,
            buffer: None,
        });
        Ok(comm_id)
    }

    /// Receive a wire message and unmarshall it.
    fn take(&self, src: Option<Location>, tag: u64) -> Result<Option<PolicyMsg>> {
        if self.strategy == RecvStrategy::PrePost {
            // Pre-posted slots cannot take arbitrary sizes.
            if let Some((_, _, len)) = self.fabric.try_probe(self.my_location, src, tag) {
                if len > self.max_msg_size {
                    return Err(CommError::TooLarge {
                        size: len,
                        bound: self.max_msg_size,
                    });
                }
            }
        }
        match self.fabric.recv(self.my_location, src, tag) {
            Some(wire) => {
                let msg = unmarshall(&wire.bytes, None, Self::wire_flags())?;
                trace!(src = %wire.src, kind = ?msg.kind(), msg_id = msg.msg_id, "received message");
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// One poll pass over outgoing completions, awaited responses and
    /// unsolicited arrivals.
    pub fn poll(&mut self) -> Result<Polled> {
        // Outgoing: reclaim completed sends, convert two-way requests into
        // awaited responses.
        let mut idx = 0;
        while idx < self.outgoing.len() {
            if self.outgoing[idx].ticket.is_complete() {
                let handle = self.outgoing.swap_remove(idx);
                if handle.two_way {
                    self.incoming.push(IncomingHandle {
                        msg_id: handle.msg_id,
                        src: handle.target,
                    });
                }
                // One-way: buffer reclaimed by dropping the handle.
            } else {
                idx += 1;
            }
        }

        // Incoming: probe for each awaited response.
        for i in 0..self.incoming.len() {
            let handle = &self.incoming[i];
            if let Some(msg) = self.take(Some(handle.src), handle.msg_id)? {
                debug_assert!(msg.is_response());
                debug_assert_eq!(msg.msg_id, self.incoming[i].msg_id);
                self.incoming.swap_remove(i);
                return Ok(Polled::Response(msg));
            }
        }

        // Anything unsolicited: requests and asynchronous responses all
        // travel under the SEND_ANY_ID tag. Correlated responses are
        // never taken here, only through their handle.
        if let Some(msg) = self.take(None, SEND_ANY_ID)? {
            return Ok(Polled::Unsolicited(msg));
        }

        Ok(Polled::None {
            outgoing_empty: self.outgoing.is_empty(),
            incoming_empty: self.incoming.is_empty(),
        })
    }

    /// Poll until something arrives, parking on the fabric in between.
    pub fn wait(&mut self, timeout: Duration) -> Result<Polled> {
        loop {
            match self.poll()? {
                Polled::None { .. } => {
                    if !self.fabric.wait(self.my_location, timeout) {
                        return self.poll();
                    }
                }
                polled => return Ok(polled),
            }
        }
    }

    /// Declare a peer dead; pending sends to it will not complete.
    pub fn mark_dead(&mut self, loc: Location) {
        warn!(peer = %loc, "marking peer dead");
        self.fabric.mark_dead(loc);
        self.incoming.retain(|h| h.src != loc);
    }

    pub fn has_pending(&self) -> bool {
        !self.outgoing.is_empty() || !self.incoming.is_empty()
    }
}
