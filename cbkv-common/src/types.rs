//! # Protocol Value Types
//!
//! Small newtypes that travel in the fixed header or in extras.
//!
//! ## Design Principles
//!
//! 1. **Typed Header Fields**: vBucket ids, CAS values and expiries are
//!    distinct types so they cannot be swapped when building a frame.
//! 2. **Protocol Semantics for Expiry**: expiries up to 30 days are sent as
//!    relative seconds; longer ones become absolute Unix timestamps, exactly
//!    as the server interprets the 32-bit field.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, ProtocolResult};

/// Largest expiry the server treats as relative (30 days, in seconds).
pub const RELATIVE_EXPIRY_LIMIT: u32 = 30 * 24 * 60 * 60;

/// Hash-bucket index used to route a key to its owning node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VBucketId(pub u16);

impl VBucketId {
    /// Returns the raw header value.
    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for VBucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb{}", self.0)
    }
}

/// Compare-and-swap token returned by the server for every mutation.
///
/// Zero means "no CAS check" on requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cas(pub u64);

impl Cas {
    /// Request CAS that disables the server-side check.
    pub const NONE: Cas = Cas(0);

    /// Returns true when this CAS disables the check.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// 32-bit expiry field as it appears on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Expiry(u32);

impl Expiry {
    /// Document never expires.
    pub const NEVER: Expiry = Expiry(0);

    /// Builds an expiry from a raw wire value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Expiry(raw)
    }

    /// Converts a time-to-live into the wire representation.
    ///
    /// # Errors
    /// Returns `ProtocolError::ExpiryOutOfRange` when the TTL has a
    /// sub-second remainder but no whole seconds (it would silently become
    /// "never"), or when the resulting absolute timestamp overflows 32 bits.
    ///
    /// # Examples
    /// ```rust
    /// use std::time::{Duration, UNIX_EPOCH};
    /// use cbkv_common::Expiry;
    ///
    /// let ttl = Expiry::from_ttl(Duration::from_secs(60), UNIX_EPOCH).unwrap();
    /// assert_eq!(ttl.as_raw(), 60);
    /// ```
    pub fn from_ttl(ttl: Duration, now: SystemTime) -> ProtocolResult<Self> {
        if ttl.is_zero() {
            return Ok(Expiry::NEVER);
        }
        let secs = ttl.as_secs();
        if secs == 0 {
            return Err(ProtocolError::ExpiryOutOfRange(ttl));
        }
        if secs <= RELATIVE_EXPIRY_LIMIT as u64 {
            return Ok(Expiry(secs as u32));
        }

        let base = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let absolute = base
            .checked_add(secs)
            .filter(|abs| *abs <= u32::MAX as u64)
            .ok_or(ProtocolError::ExpiryOutOfRange(ttl))?;
        Ok(Expiry(absolute as u32))
    }

    /// Returns the raw wire value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns true for "never expires".
    #[inline]
    pub const fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Resolves the wire value into an absolute deadline.
    ///
    /// Mirrors how a node interprets the field: relative for values up to
    /// `RELATIVE_EXPIRY_LIMIT`, absolute Unix seconds beyond it.
    pub fn deadline(self, now: SystemTime) -> Option<SystemTime> {
        match self.0 {
            0 => None,
            secs if secs <= RELATIVE_EXPIRY_LIMIT => Some(now + Duration::from_secs(secs as u64)),
            secs => Some(UNIX_EPOCH + Duration::from_secs(secs as u64)),
        }
    }
}
