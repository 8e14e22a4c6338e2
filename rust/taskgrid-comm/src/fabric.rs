//! Wire fabric
//!
//! The raw transport between policy domains: tagged byte messages with
//! selective receive on (source, tag). The in-process channel fabric backs
//! single-machine clusters and the test suites; a networked fabric plugs
//! in behind the same trait.

use crate::error::{CommError, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgrid_guid::Location;
use taskgrid_proto::RECV_ANY_ID;
use tracing::debug;

/// A message on the wire.
#[derive(Debug, Clone)]
pub struct WireMsg {
    pub src: Location,
    pub dest: Location,
    /// Correlation tag; `SEND_ANY_ID` for unsolicited traffic.
    pub tag: u64,
    pub bytes: Vec<u8>,
    #[cfg(feature = "net-monitor")]
    pub send_time: std::time::Instant,
}

impl WireMsg {
    pub fn new(src: Location, dest: Location, tag: u64, bytes: Vec<u8>) -> WireMsg {
        WireMsg {
            src,
            dest,
            tag,
            bytes,
            #[cfg(feature = "net-monitor")]
            send_time: std::time::Instant::now(),
        }
    }
}

/// Completion marker of an asynchronous send.
#[derive(Debug, Clone)]
pub struct SendTicket(Arc<AtomicBool>);

impl SendTicket {
    pub fn completed() -> SendTicket {
        SendTicket(Arc::new(AtomicBool::new(true)))
    }

    pub fn pending() -> SendTicket {
        SendTicket(Arc::new(AtomicBool::new(false)))
    }

    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Transport between policy domains.
pub trait Fabric: Send + Sync {
    /// Hand bytes to the wire. The ticket completes when the buffer has
    /// left the sender and may be reclaimed.
    fn send(&self, msg: WireMsg) -> Result<SendTicket>;

    /// Non-blocking probe for a message at `at` matching the source and
    /// tag filters (`RECV_ANY_ID` matches any tag). Returns source, tag
    /// and byte count without consuming the message.
    fn try_probe(&self, at: Location, src: Option<Location>, tag: u64)
        -> Option<(Location, u64, usize)>;

    /// Consume the first message matching the filters.
    fn recv(&self, at: Location, src: Option<Location>, tag: u64) -> Option<WireMsg>;

    /// Block until any message is available at `at`, with a timeout to
    /// let the caller interleave other work.
    fn wait(&self, at: Location, timeout: Duration) -> bool;

    /// Declare a peer unreachable. Subsequent sends fail with `PeerDead`.
    fn mark_dead(&self, loc: Location);

    fn is_dead(&self, loc: Location) -> bool;
}

struct Mailbox {
    queue: Mutex<VecDeque<WireMsg>>,
    ready: Condvar,
}

impl Mailbox {
    fn new() -> Mailbox {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }
}

fn matches(msg: &WireMsg, src: Option<Location>, tag: u64) -> bool {
    src.map_or(true, |s| msg.src == s) && (tag == RECV_ANY_ID || msg.tag == tag)
}

/// In-process fabric: one mailbox per policy domain.
pub struct ChannelFabric {
    boxes: DashMap<Location, Arc<Mailbox>>,
    dead: DashMap<Location, ()>,
}

impl ChannelFabric {
    pub fn new(locations: impl IntoIterator<Item = Location>) -> ChannelFabric {
        let fabric = ChannelFabric {
            boxes: DashMap::new(),
            dead: DashMap::new(),
        };
        for loc in locations {
            fabric.boxes.insert(loc, Arc::new(Mailbox::new()));
        }
        fabric
    }

    fn mailbox(&self, loc: Location) -> Result<Arc<Mailbox>> {
        self.boxes
            .get(&loc)
            .map(|m| Arc::clone(&m))
            .ok_or(CommError::UnknownPeer(loc))
    }
}

impl Fabric for ChannelFabric {
    fn send(&self, msg: WireMsg) -> Result<SendTicket> {
        if self.is_dead(msg.dest) {
            return Err(CommError::PeerDead(msg.dest));
        }
        let mailbox = self.mailbox(msg.dest)?;
        debug!(src = %msg.src, dest = %msg.dest, tag = msg.tag, len = msg.bytes.len(), "wire send");
        let mut queue = mailbox.queue.lock();
        queue.push_back(msg);
        mailbox.ready.notify_all();
        // The bytes are owned by the destination mailbox now.
        Ok(SendTicket::completed())
    }

    fn try_probe(
        &self,
        at: Location,
        src: Option<Location>,
        tag: u64,
    ) -> Option<(Location, u64, usize)> {
        let mailbox = self.mailbox(at).ok()?;
        let queue = mailbox.queue.lock();
        queue
            .iter()
            .find(|m| matches(m, src, tag))
            .map(|m| (m.src, m.tag, m.bytes.len()))
    }

    fn recv(&self, at: Location, src: Option<Location>, tag: u64) -> Option<WireMsg> {
        let mailbox = self.mailbox(at).ok()?;
        let mut queue = mailbox.queue.lock();
        let idx = queue.iter().position(|m| matches(m, src, tag))?;
        queue.remove(idx)
    }

    fn wait(&self, at: Location, timeout: Duration) -> bool {
        let Ok(mailbox) = self.mailbox(at) else {
            return false;
        };
        let mut queue = mailbox.queue.lock();
        if !queue.is_empty() {
            return true;
        }
        mailbox.ready.wait_for(&mut queue, timeout);
        !queue.is_empty()
    }

    fn mark_dead(&self, loc: Location) {
        self.dead.insert(loc, ());
    }

    fn is_dead(&self, loc: Location) -> bool {
        self.dead.contains_key(&loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric() -> ChannelFabric {
        ChannelFabric::new([Location(0), Location(1)])
    }

    #[test]
    fn selective_receive_matches_source_and_tag() {
        let f = fabric();
        f.send(WireMsg::new(Location(0), Location(1), 7, vec![1])).unwrap();
        f.send(WireMsg::new(Location(0), Location(1), 9, vec![2, 2])).unwrap();

        assert!(f.try_probe(Location(1), Some(Location(0)), 9).is_some());
        let m = f.recv(Location(1), Some(Location(0)), 9).unwrap();
        assert_eq!(m.bytes, vec![2, 2]);
        // The tag-7 message is still queued.
        let (src, tag, len) = f.try_probe(Location(1), None, RECV_ANY_ID).unwrap();
        assert_eq!((src, tag, len), (Location(0), 7, 1));
    }

    #[test]
    fn probe_does_not_consume() {
        let f = fabric();
        f.send(WireMsg::new(Location(1), Location(0), 3, vec![9])).unwrap();
        assert!(f.try_probe(Location(0), None, RECV_ANY_ID).is_some());
        assert!(f.try_probe(Location(0), None, RECV_ANY_ID).is_some());
        assert!(f.recv(Location(0), None, 3).is_some());
        assert!(f.try_probe(Location(0), None, RECV_ANY_ID).is_none());
    }

    #[test]
    fn sends_to_a_dead_peer_fail() {
        let f = fabric();
        f.mark_dead(Location(1));
        let err = f
            .send(WireMsg::new(Location(0), Location(1), 0, vec![]))
            .unwrap_err();
        assert!(matches!(err, CommError::PeerDead(Location(1))));
    }
}
