//! Communication platform
//!
//! Network transport beneath the message bus: a fabric abstraction over
//! the actual wire, outgoing/incoming handle tracking, and the two receive
//! strategies (probe-based and pre-post). The communication worker of a
//! policy domain is the sole caller of `poll`/`wait`.

pub mod error;
pub mod fabric;
pub mod handles;
pub mod platform;

pub use error::{CommError, Result};
pub use fabric::{ChannelFabric, Fabric, SendTicket, WireMsg};
pub use handles::{IncomingHandle, OutgoingHandle};
pub use platform::{CommPlatform, Polled, RecvStrategy};
