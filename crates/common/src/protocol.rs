//! Protocol version utilities.
//!
//! Bucket files carry the protocol version of the ledger that produced them
//! in their leading `METAENTRY`. Several bucket semantics are gated on that
//! version, most notably the `INITENTRY` optimization.
//!
//! ```rust
//! use henyey_common::protocol::{
//!     protocol_version_starts_from, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
//! };
//!
//! assert!(protocol_version_starts_from(11, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY));
//! assert!(!protocol_version_starts_from(10, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY));
//! ```

/// Protocol versions that bucket and meta handling is gated on.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V0 = 0,
    V11 = 11,
    V20 = 20,
    V23 = 23,
}

impl ProtocolVersion {
    /// Convert to the underlying `u32` value.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// The first protocol whose buckets may contain `INITENTRY` and `METAENTRY`
/// records (CAP-0020).
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: ProtocolVersion =
    ProtocolVersion::V11;

/// The protocol version when Soroban smart contracts were first introduced.
///
/// Contract data, contract code and TTL entries only exist from here on.
pub const SOROBAN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V20;

/// The protocol version that introduced the hot archive bucket list.
pub const HOT_ARCHIVE_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V23;

/// Returns `true` if `version` is strictly before the target version.
#[inline]
pub fn protocol_version_is_before(version: u32, before: ProtocolVersion) -> bool {
    version < before.as_u32()
}

/// Returns `true` if `version` is at or after the target version.
///
/// # Example
///
/// ```rust
/// use henyey_common::protocol::{protocol_version_starts_from, ProtocolVersion};
///
/// assert!(protocol_version_starts_from(20, ProtocolVersion::V20));
/// assert!(!protocol_version_starts_from(19, ProtocolVersion::V20));
/// ```
#[inline]
pub fn protocol_version_starts_from(version: u32, from: ProtocolVersion) -> bool {
    version >= from.as_u32()
}
