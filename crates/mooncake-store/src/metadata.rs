//! Object metadata and the sharded store
//!
//! Metadata is partitioned into a fixed number of shards, each guarded
//! by its own mutex. Every operation touches exactly one key, so a
//! per-shard mutex bounds contention without a lock hierarchy; batch
//! operations re-enter the accessor once per key rather than holding two
//! shard locks at once.

use mooncake_segment::{AllocatedBuffer, BufferDescriptor, BufferStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use xxhash_rust::xxh64::xxh64;

/// Number of metadata shards. Power of two so the shard index is a mask.
pub const N_SHARDS: usize = 64;

/// Upload state of one replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// PutStart allocated the handles; the client is still writing
    Processing,
    /// PutEnd confirmed the copy; the replica is readable
    Complete,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// One physical copy of an object: an ordered list of buffer handles
/// whose sizes sum to the object size.
pub struct Replica {
    handles: Vec<AllocatedBuffer>,
    status: ReplicaStatus,
}

impl Replica {
    /// New replica in `Processing` state, taking ownership of its handles
    #[must_use]
    pub fn new(handles: Vec<AllocatedBuffer>) -> Self {
        Self {
            handles,
            status: ReplicaStatus::Processing,
        }
    }

    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    pub fn mark_complete(&mut self) {
        self.status = ReplicaStatus::Complete;
    }

    /// True if any handle lost its backing allocator
    #[must_use]
    pub fn has_invalid_handle(&self) -> bool {
        self.handles
            .iter()
            .any(|handle| handle.status() == BufferStatus::Invalid)
    }

    /// Names of the segments this replica occupies
    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(AllocatedBuffer::segment_name)
    }

    /// Snapshot for the wire
    #[must_use]
    pub fn descriptor(&self) -> ReplicaDescriptor {
        ReplicaDescriptor {
            status: self.status,
            buffers: self.handles.iter().map(AllocatedBuffer::descriptor).collect(),
        }
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("status", &self.status)
            .field("handles", &self.handles.len())
            .finish()
    }
}

/// Wire-facing description of one replica
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub status: ReplicaStatus,
    pub buffers: Vec<BufferDescriptor>,
}

/// Per-object record held by a shard
pub struct ObjectMetadata {
    /// Object size in bytes
    pub size: u64,
    /// All replicas, complete or in flight
    pub replicas: Vec<Replica>,
    /// Lease deadline. `None` is the +∞ sentinel set at PutStart so an
    /// object cannot be reclaimed mid-upload; PutEnd resets it to `now`.
    pub lease_timeout: Option<Instant>,
}

impl ObjectMetadata {
    #[must_use]
    pub fn new(size: u64, replicas: Vec<Replica>) -> Self {
        Self {
            size,
            replicas,
            lease_timeout: None,
        }
    }

    /// Extend the lease to at least `now + ttl`. Never shortens an
    /// already-longer lease.
    pub fn grant_lease(&mut self, ttl: Duration, now: Instant) {
        let deadline = now + ttl;
        self.lease_timeout = Some(match self.lease_timeout {
            Some(current) => current.max(deadline),
            None => deadline,
        });
    }

    /// Drop the upload sentinel: unleased as of `now`, eligible for
    /// eviction until a reader grants a fresh lease.
    pub fn set_unleased(&mut self, now: Instant) {
        self.lease_timeout = Some(now);
    }

    /// True once the lease deadline has passed. The upload sentinel
    /// never expires.
    #[must_use]
    pub fn is_lease_expired(&self, now: Instant) -> bool {
        match self.lease_timeout {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// First replica whose status differs from `expected`, if any
    #[must_use]
    pub fn has_diff_rep_status(&self, expected: ReplicaStatus) -> Option<ReplicaStatus> {
        self.replicas
            .iter()
            .map(Replica::status)
            .find(|status| *status != expected)
    }

    /// Drop replicas with invalid handles. Returns true when no valid
    /// replica remains and the whole entry should go.
    pub fn cleanup_stale_handles(&mut self) -> bool {
        self.replicas.retain(|replica| !replica.has_invalid_handle());
        self.replicas.is_empty()
    }
}

impl fmt::Debug for ObjectMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMetadata")
            .field("size", &self.size)
            .field("replicas", &self.replicas)
            .finish()
    }
}

/// One metadata shard: a mutex over the key map
#[derive(Default)]
pub struct Shard {
    pub entries: Mutex<HashMap<String, ObjectMetadata>>,
}

/// The sharded object→metadata map
pub struct MetadataStore {
    shards: Vec<Shard>,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..N_SHARDS).map(|_| Shard::default()).collect(),
        }
    }

    /// The shard owning `key`, by stable hash
    #[must_use]
    pub fn shard(&self, key: &str) -> &Shard {
        &self.shards[xxh64(key.as_bytes(), 0) as usize & (N_SHARDS - 1)]
    }

    /// All shards, for sweeps
    #[must_use]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Total number of objects across shards
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.entries.lock().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_mapping_is_stable() {
        let store = MetadataStore::new();
        let a = store.shard("key-a") as *const Shard;
        let b = store.shard("key-a") as *const Shard;
        assert_eq!(a, b);
    }

    #[test]
    fn test_lease_lifecycle() {
        let now = Instant::now();
        let mut meta = ObjectMetadata::new(4096, Vec::new());

        // Upload sentinel: leased forever
        assert!(!meta.is_lease_expired(now + Duration::from_secs(3600)));

        meta.set_unleased(now);
        assert!(meta.is_lease_expired(now));

        meta.grant_lease(Duration::from_millis(500), now);
        assert!(!meta.is_lease_expired(now));
        assert!(meta.is_lease_expired(now + Duration::from_millis(500)));
    }

    #[test]
    fn test_grant_lease_never_shortens() {
        let now = Instant::now();
        let mut meta = ObjectMetadata::new(4096, Vec::new());
        meta.grant_lease(Duration::from_secs(10), now);
        meta.grant_lease(Duration::from_secs(1), now);
        assert!(!meta.is_lease_expired(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_diff_rep_status_on_empty() {
        let meta = ObjectMetadata::new(4096, Vec::new());
        assert_eq!(meta.has_diff_rep_status(ReplicaStatus::Complete), None);
    }
}
