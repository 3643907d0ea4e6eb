//! Segment registry
//!
//! Segments are indexed by id and by owning client. All access goes
//! through a single reader-writer lock with two scoped modes: *segment
//! access* (write lock, registry mutation and allocator teardown) and
//! *allocator access* (read lock, the view PutStart allocates from).
//!
//! UnmountSegment is two-phase. Prepare tears the allocator down but
//! keeps the segment shell registered; the caller then sweeps object
//! metadata without the segment lock held, and commit removes the shell.
//! Holding the lock across the sweep would deadlock against PutStart,
//! which takes a shard mutex before requesting allocator access.

use crate::allocator::BufferAllocator;
use crate::metrics::StorageMetrics;
use mooncake_common::{ClientId, Error, Result, SegmentId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// A client-contributed memory region
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Unique id; mounting the same id twice is idempotent
    pub id: SegmentId,
    /// Transfer-engine name the client registered the region under
    pub name: String,
    /// Base address within the contributing client's address space
    pub base: u64,
    /// Region size in bytes
    pub size: u64,
}

/// Registry entry for one segment. `allocator` is `None` between the
/// prepare and commit phases of an unmount.
pub struct MountedSegment {
    pub segment: Segment,
    pub owner: ClientId,
    pub allocator: Option<Arc<BufferAllocator>>,
}

struct Registry {
    segments: HashMap<SegmentId, MountedSegment>,
    by_client: HashMap<ClientId, HashSet<SegmentId>>,
}

/// Segment registry behind the segment-subsystem RW lock
pub struct SegmentManager {
    registry: RwLock<Registry>,
    metrics: Arc<StorageMetrics>,
}

impl SegmentManager {
    #[must_use]
    pub fn new(metrics: Arc<StorageMetrics>) -> Self {
        Self {
            registry: RwLock::new(Registry {
                segments: HashMap::new(),
                by_client: HashMap::new(),
            }),
            metrics,
        }
    }

    /// Exclusive access: registry mutation and allocator lifecycle
    #[must_use]
    pub fn segment_access(&self) -> SegmentAccess<'_> {
        SegmentAccess {
            registry: self.registry.write(),
            metrics: &self.metrics,
        }
    }

    /// Shared access: the read-only allocator view used by PutStart
    #[must_use]
    pub fn allocator_access(&self) -> AllocatorAccess<'_> {
        AllocatorAccess {
            registry: self.registry.read(),
        }
    }

    /// Capacity counters shared with the allocators
    #[must_use]
    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }
}

/// Write-locked view of the registry
pub struct SegmentAccess<'a> {
    registry: RwLockWriteGuard<'a, Registry>,
    metrics: &'a Arc<StorageMetrics>,
}

impl SegmentAccess<'_> {
    /// Mount a segment for `client_id`. Fails with `SegmentAlreadyExists`
    /// when the id is taken; the caller translates that into OK.
    pub fn mount_segment(&mut self, segment: Segment, client_id: ClientId) -> Result<()> {
        if segment.name.is_empty() {
            return Err(Error::invalid_params("segment name must not be empty"));
        }
        if segment.size == 0 {
            return Err(Error::invalid_params(format!(
                "segment {} has zero size",
                segment.name
            )));
        }
        if self.registry.segments.contains_key(&segment.id) {
            return Err(Error::SegmentAlreadyExists(segment.name));
        }

        let allocator = BufferAllocator::new(
            segment.name.clone(),
            segment.base,
            segment.size,
            self.metrics.clone(),
        );
        self.metrics.add_capacity(segment.size);
        info!(
            "Mounted segment {} ({} bytes) for client {}",
            segment.name, segment.size, client_id
        );
        self.registry
            .by_client
            .entry(client_id)
            .or_default()
            .insert(segment.id);
        self.registry.segments.insert(
            segment.id,
            MountedSegment {
                segment,
                owner: client_id,
                allocator: Some(allocator),
            },
        );
        Ok(())
    }

    /// Remount a returning client's segments. Segments already present
    /// are skipped; any other mount failure aborts the remount.
    pub fn remount_segments(&mut self, segments: &[Segment], client_id: ClientId) -> Result<()> {
        for segment in segments {
            match self.mount_segment(segment.clone(), client_id) {
                Ok(()) => {}
                Err(Error::SegmentAlreadyExists(name)) => {
                    warn!("Segment {name} already mounted during remount, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Phase one of unmount: tear down the allocator, keep the shell.
    /// Returns the capacity to subtract at commit.
    pub fn prepare_unmount(&mut self, segment_id: SegmentId) -> Result<u64> {
        let entry = self
            .registry
            .segments
            .get_mut(&segment_id)
            .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
        let allocator = entry
            .allocator
            .take()
            .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
        allocator.close();
        Ok(entry.segment.size)
    }

    /// Phase three of unmount: drop the shell and the capacity.
    pub fn commit_unmount(
        &mut self,
        segment_id: SegmentId,
        client_id: ClientId,
        dec_capacity: u64,
    ) {
        if let Some(entry) = self.registry.segments.remove(&segment_id) {
            info!(
                "Unmounted segment {} of client {}",
                entry.segment.name, client_id
            );
        }
        if let Some(ids) = self.registry.by_client.get_mut(&client_id) {
            ids.remove(&segment_id);
            if ids.is_empty() {
                self.registry.by_client.remove(&client_id);
            }
        }
        self.metrics.sub_capacity(dec_capacity);
    }

    /// Every segment currently registered to `client_id`
    #[must_use]
    pub fn client_segments(&self, client_id: ClientId) -> Vec<Segment> {
        self.registry
            .by_client
            .get(&client_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.registry.segments.get(id))
                    .map(|entry| entry.segment.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of all live (not mid-unmount) segments
    #[must_use]
    pub fn all_segments(&self) -> Vec<String> {
        self.registry
            .segments
            .values()
            .filter(|entry| entry.allocator.is_some())
            .map(|entry| entry.segment.name.clone())
            .collect()
    }

    /// `(used, capacity)` aggregated over live segments with this name
    pub fn query_segment(&self, name: &str) -> Result<(u64, u64)> {
        let mut used = 0;
        let mut capacity = 0;
        let mut found = false;
        for entry in self.registry.segments.values() {
            if entry.segment.name != name {
                continue;
            }
            if let Some(allocator) = &entry.allocator {
                used += allocator.used();
                capacity += allocator.capacity();
                found = true;
            }
        }
        if !found {
            return Err(Error::SegmentNotFound(name.to_string()));
        }
        Ok((used, capacity))
    }
}

/// Read-locked view exposing the live allocators
pub struct AllocatorAccess<'a> {
    registry: RwLockReadGuard<'a, Registry>,
}

impl AllocatorAccess<'_> {
    /// All live allocators, in registry order
    #[must_use]
    pub fn allocators(&self) -> Vec<&Arc<BufferAllocator>> {
        self.registry
            .segments
            .values()
            .filter_map(|entry| entry.allocator.as_ref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SegmentManager {
        SegmentManager::new(Arc::new(StorageMetrics::new()))
    }

    fn segment(name: &str, size: u64) -> Segment {
        Segment {
            id: SegmentId::new(),
            name: name.to_string(),
            base: 0x4000_0000,
            size,
        }
    }

    #[test]
    fn test_mount_and_query() {
        let mgr = manager();
        let client = ClientId::new();
        let seg = segment("seg-a", 1 << 20);

        mgr.segment_access()
            .mount_segment(seg.clone(), client)
            .unwrap();
        assert_eq!(mgr.metrics().total_capacity(), 1 << 20);

        let access = mgr.segment_access();
        assert_eq!(access.all_segments(), vec!["seg-a".to_string()]);
        assert_eq!(access.query_segment("seg-a").unwrap(), (0, 1 << 20));
        assert!(matches!(
            access.query_segment("missing"),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_mount_reports_already_exists() {
        let mgr = manager();
        let client = ClientId::new();
        let seg = segment("seg-a", 4096);

        mgr.segment_access()
            .mount_segment(seg.clone(), client)
            .unwrap();
        let err = mgr
            .segment_access()
            .mount_segment(seg, client)
            .unwrap_err();
        assert!(matches!(err, Error::SegmentAlreadyExists(_)));
        // Capacity counted once
        assert_eq!(mgr.metrics().total_capacity(), 4096);
    }

    #[test]
    fn test_two_phase_unmount() {
        let mgr = manager();
        let client = ClientId::new();
        let seg = segment("seg-a", 4096);
        let id = seg.id;

        mgr.segment_access().mount_segment(seg, client).unwrap();
        let handle = {
            let access = mgr.allocator_access();
            access.allocators()[0].allocate(1024).unwrap()
        };

        let dec = mgr.segment_access().prepare_unmount(id).unwrap();
        assert_eq!(dec, 4096);
        // Shell survives prepare, but the segment no longer serves allocations
        assert!(mgr.segment_access().all_segments().is_empty());
        assert_eq!(
            handle.status(),
            crate::allocator::BufferStatus::Invalid
        );
        // Capacity drops at commit, not before
        assert_eq!(mgr.metrics().total_capacity(), 4096);

        mgr.segment_access().commit_unmount(id, client, dec);
        assert_eq!(mgr.metrics().total_capacity(), 0);
        assert!(mgr.segment_access().client_segments(client).is_empty());

        // Idempotent: a second unmount sees no segment
        assert!(matches!(
            mgr.segment_access().prepare_unmount(id),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_remount_skips_existing() {
        let mgr = manager();
        let client = ClientId::new();
        let seg_a = segment("seg-a", 4096);
        let seg_b = segment("seg-b", 4096);

        mgr.segment_access()
            .mount_segment(seg_a.clone(), client)
            .unwrap();
        mgr.segment_access()
            .remount_segments(&[seg_a, seg_b], client)
            .unwrap();

        let mut names = mgr.segment_access().all_segments();
        names.sort();
        assert_eq!(names, vec!["seg-a".to_string(), "seg-b".to_string()]);
        assert_eq!(mgr.metrics().total_capacity(), 8192);
    }
}
