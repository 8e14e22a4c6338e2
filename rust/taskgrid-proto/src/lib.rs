//! Policy-domain message protocol
//!
//! Typed messages exchanged between (and within) policy domains: a fixed
//! header, a per-kind base of request/response fields, and a payload area
//! of variable-size sections referenced from the base through
//! `(offset << 1) | in_addl` tokens. The same encoding is used for
//! intra-PD handoff and for cross-PD RPC so heterogeneous installations
//! stay wire-compatible.

pub mod error;
pub mod hint;
pub mod msg;
pub mod ret;
pub mod runlevel;
pub mod wire;

pub use error::{ProtoError, Result};
pub use hint::{DbHint, EdtHint, RuntimeHints};
pub use msg::*;
pub use ret::ReturnCode;
pub use runlevel::{RlProps, Runlevel};
pub use wire::{
    marshall, msg_base_size, msg_sizes, unmarshall, MarshallFlags, MarshallMode, MsgBuffer,
    HEADER_SIZE, MAX_ALIGN,
};
