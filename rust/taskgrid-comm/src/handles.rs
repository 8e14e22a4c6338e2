//! Handle tracking
//!
//! Every outgoing send is tracked until the transport releases the buffer;
//! every request that expects a response is tracked until the matching
//! response arrives. Both lists are mutated only by the communication
//! worker.

use crate::fabric::SendTicket;
use taskgrid_guid::Location;

/// A send in flight.
#[derive(Debug)]
pub struct OutgoingHandle {
    pub msg_id: u64,
    pub target: Location,
    /// Completion of the transport-level send.
    pub ticket: SendTicket,
    /// The send was a two-way request: completion moves the handle to the
    /// incoming list to await the response.
    pub two_way: bool,
    /// The marshalled copy is owned here and reclaimed on completion.
    pub buffer: Option<Vec<u8>>,
}

/// A response being awaited.
#[derive(Debug)]
pub struct IncomingHandle {
    /// Correlation id the response will carry as its tag.
    pub msg_id: u64,
    /// Peer the response will come from.
    pub src: Location,
}
