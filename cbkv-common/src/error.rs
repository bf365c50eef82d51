//! # Protocol Errors
//!
//! Failures raised while encoding or decoding binary protocol frames.
//! These never carry I/O context; the client wraps them with node identity.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{MAX_BODY_LEN, MAX_KEY_LEN};

/// Result type for protocol encode/decode helpers.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Framing and payload layout errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First header byte is neither the request nor the response magic
    /// expected by the reader.
    #[error("invalid magic byte 0x{0:02x}")]
    InvalidMagic(u8),

    /// Opcode byte is not one this implementation understands.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Extras and key lengths do not fit inside the declared body length.
    #[error("body length {body} cannot hold extras ({extras}) and key ({key})")]
    InconsistentLengths { body: u32, extras: u8, key: u16 },

    /// Declared body length exceeds the frame cap.
    #[error("body of {0} bytes exceeds the {MAX_BODY_LEN} byte frame cap")]
    BodyTooLarge(u32),

    /// Key does not fit the protocol key limit.
    #[error("key of {0} bytes exceeds the {MAX_KEY_LEN} byte limit")]
    KeyTooLong(usize),

    /// Extras section longer than the one-byte length field allows.
    #[error("extras of {0} bytes exceed 255")]
    ExtrasTooLong(usize),

    /// Sub-document path longer than the two-byte length field allows.
    #[error("sub-document path of {0} bytes is too long")]
    PathTooLong(usize),

    /// Expiration cannot be represented as a 32-bit protocol expiry.
    #[error("expiry {0:?} is outside the representable range")]
    ExpiryOutOfRange(Duration),

    /// A structured payload ended before its declared length.
    #[error("truncated {0}")]
    Truncated(&'static str),
}
