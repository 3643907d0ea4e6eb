//! Core identifier types for the Mooncake master
//!
//! Segments and clients are named by 128-bit UUIDs. On the wire they travel
//! as pairs of 64-bit integers, so both newtypes expose `as_u64_pair` /
//! `from_u64_pair` alongside the usual UUID accessors.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Largest single slice a client may request in PutStart (64 MiB).
pub const MAX_SLICE_SIZE: u64 = 64 * 1024 * 1024;

/// Monotonic version of the master's view of the cluster, returned by Ping.
pub type ViewVersionId = u64;

/// Unique identifier for a mounted segment
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct SegmentId(Uuid);

impl SegmentId {
    /// Generate a new random segment ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from the wire representation (two 64-bit halves)
    #[must_use]
    pub const fn from_u64_pair(hi: u64, lo: u64) -> Self {
        Self(Uuid::from_u64_pair(hi, lo))
    }

    /// Get the wire representation (two 64-bit halves)
    #[must_use]
    pub const fn as_u64_pair(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a client contributing segments
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new random client ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from the wire representation (two 64-bit halves)
    #[must_use]
    pub const fn from_u64_pair(hi: u64, lo: u64) -> Self {
        Self(Uuid::from_u64_pair(hi, lo))
    }

    /// Get the wire representation (two 64-bit halves)
    #[must_use]
    pub const fn as_u64_pair(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness status of a client as seen by the master (HA mode)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    /// Client is heartbeating and its segments are mounted
    #[default]
    Ok,
    /// Client expired; it must issue ReMountSegment to rejoin
    NeedRemount,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::NeedRemount => write!(f, "need_remount"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_id_wire_roundtrip() {
        let id = SegmentId::new();
        let (hi, lo) = id.as_u64_pair();
        assert_eq!(SegmentId::from_u64_pair(hi, lo), id);
    }

    #[test]
    fn test_client_id_wire_roundtrip() {
        let id = ClientId::new();
        let (hi, lo) = id.as_u64_pair();
        assert_eq!(ClientId::from_u64_pair(hi, lo), id);
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(SegmentId::new(), SegmentId::new());
        assert_ne!(ClientId::new(), ClientId::new());
    }
}
