//! Return codes carried across policy domains
//!
//! Cross-PD errors travel in the response's `return_detail` field; these
//! are values, never panics.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0,
    /// Completion requires a remote fetch; block or register a continuation.
    Pending = 1,
    /// Momentary contention; retry via the scheduler update.
    Busy = 2,
    NoMemory = 3,
    NotPermitted = 4,
    GuidExists = 5,
    NoMessage = 6,
    PollMore = 7,
    Invalid = 8,
    NotSupported = 9,
}

impl ReturnCode {
    pub fn from_bits(bits: u8) -> ReturnCode {
        match bits {
            0 => ReturnCode::Ok,
            1 => ReturnCode::Pending,
            2 => ReturnCode::Busy,
            3 => ReturnCode::NoMemory,
            4 => ReturnCode::NotPermitted,
            5 => ReturnCode::GuidExists,
            6 => ReturnCode::NoMessage,
            7 => ReturnCode::PollMore,
            9 => ReturnCode::NotSupported,
            _ => ReturnCode::Invalid,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ReturnCode::Ok
    }
}

impl Default for ReturnCode {
    fn default() -> Self {
        ReturnCode::Ok
    }
}

impl From<taskgrid_guid::GuidError> for ReturnCode {
    fn from(err: taskgrid_guid::GuidError) -> ReturnCode {
        use taskgrid_guid::GuidError;
        match err {
            GuidError::GuidExists(_) => ReturnCode::GuidExists,
            GuidError::Pending => ReturnCode::Pending,
            GuidError::NotSupported(_) => ReturnCode::NotSupported,
            GuidError::NotPermitted(_) => ReturnCode::NotPermitted,
            GuidError::Invalid(_) => ReturnCode::Invalid,
            GuidError::CounterExhausted { .. } => ReturnCode::NoMemory,
        }
    }
}
