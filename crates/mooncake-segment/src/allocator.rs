//! Per-segment buffer allocator
//!
//! Each mounted segment is carved into buffer handles by a first-fit
//! extent allocator. Handles are RAII values: dropping one returns its
//! extent to the allocator. Tearing an allocator down flips its `closed`
//! flag, which turns every outstanding handle into a no-op on drop and
//! reports its status as `Invalid`, so handles never dangle after
//! UnmountSegment.

use crate::metrics::StorageMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Status of a buffer handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferStatus {
    /// Backing allocator is live; the handle may be transferred against
    Complete,
    /// Backing allocator was torn down; the handle is unusable
    Invalid,
}

/// Wire-facing description of one allocated buffer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Name of the segment holding the buffer
    pub segment_name: String,
    /// Absolute address of the buffer within the client's address space
    pub address: u64,
    /// Size of the buffer in bytes
    pub size: u64,
    /// Handle status at descriptor time
    pub status: BufferStatus,
}

/// Free-extent state guarded by the allocator mutex
struct Extents {
    /// offset -> length of each free extent
    free: BTreeMap<u64, u64>,
    /// bytes currently handed out
    used: u64,
    closed: bool,
}

/// First-fit extent allocator over one segment
pub struct BufferAllocator {
    segment_name: String,
    base: u64,
    capacity: u64,
    extents: Mutex<Extents>,
    /// Mirror of `Extents::closed` readable without the mutex
    closed: AtomicBool,
    metrics: Arc<StorageMetrics>,
}

impl BufferAllocator {
    /// Create an allocator covering `[base, base + capacity)` of a segment
    #[must_use]
    pub fn new(
        segment_name: impl Into<String>,
        base: u64,
        capacity: u64,
        metrics: Arc<StorageMetrics>,
    ) -> Arc<Self> {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Arc::new(Self {
            segment_name: segment_name.into(),
            base,
            capacity,
            extents: Mutex::new(Extents {
                free,
                used: 0,
                closed: false,
            }),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Name of the segment this allocator serves
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Total capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently handed out
    #[must_use]
    pub fn used(&self) -> u64 {
        self.extents.lock().used
    }

    /// True once the allocator has been torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Carve a buffer of exactly `size` bytes, first-fit. Returns `None`
    /// if the allocator is closed or no free extent is large enough.
    pub fn allocate(self: &Arc<Self>, size: u64) -> Option<AllocatedBuffer> {
        if size == 0 {
            return None;
        }
        let mut extents = self.extents.lock();
        if extents.closed {
            return None;
        }

        let (offset, extent_len) = extents
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(off, len)| (*off, *len))?;

        extents.free.remove(&offset);
        if extent_len > size {
            extents.free.insert(offset + size, extent_len - size);
        }
        extents.used += size;
        drop(extents);

        self.metrics.add_allocated(size);
        Some(AllocatedBuffer {
            allocator: Arc::downgrade(self),
            segment_name: self.segment_name.clone(),
            address: self.base + offset,
            offset,
            size,
        })
    }

    /// Return an extent. No-op once the allocator is closed; `close`
    /// already reconciled the accounting for every outstanding handle.
    fn release(&self, offset: u64, size: u64) {
        let mut extents = self.extents.lock();
        if extents.closed {
            return;
        }

        let handle_size = size;
        let mut offset = offset;
        let mut size = size;
        // Coalesce with the predecessor extent if adjacent
        let prev = extents
            .free
            .range(..offset)
            .next_back()
            .map(|(off, len)| (*off, *len));
        if let Some((prev_off, prev_len)) = prev {
            if prev_off + prev_len == offset {
                extents.free.remove(&prev_off);
                offset = prev_off;
                size += prev_len;
            }
        }
        // Coalesce with the successor extent if adjacent
        if let Some(next_len) = extents.free.remove(&(offset + size)) {
            size += next_len;
        }
        extents.free.insert(offset, size);
        extents.used -= handle_size.min(extents.used);
        drop(extents);

        self.metrics.sub_allocated(handle_size);
    }

    /// Tear the allocator down: invalidate every outstanding handle and
    /// release their bytes from the global accounting in one step.
    pub fn close(&self) {
        let mut extents = self.extents.lock();
        if extents.closed {
            return;
        }
        extents.closed = true;
        let used = std::mem::take(&mut extents.used);
        extents.free.clear();
        drop(extents);

        self.closed.store(true, Ordering::Release);
        self.metrics.sub_allocated(used);
    }
}

impl fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("segment_name", &self.segment_name)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An owned slice of a segment. Dropping the handle returns the slice to
/// its allocator unless the allocator has been torn down in the meantime.
pub struct AllocatedBuffer {
    allocator: Weak<BufferAllocator>,
    segment_name: String,
    address: u64,
    offset: u64,
    size: u64,
}

impl AllocatedBuffer {
    /// Name of the backing segment
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Absolute address within the contributing client's address space
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current status: `Invalid` the instant the backing allocator is
    /// torn down, `Complete` otherwise.
    #[must_use]
    pub fn status(&self) -> BufferStatus {
        match self.allocator.upgrade() {
            Some(alloc) if !alloc.is_closed() => BufferStatus::Complete,
            _ => BufferStatus::Invalid,
        }
    }

    /// Snapshot this handle for the wire
    #[must_use]
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            segment_name: self.segment_name.clone(),
            address: self.address,
            size: self.size,
            status: self.status(),
        }
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        if let Some(alloc) = self.allocator.upgrade() {
            alloc.release(self.offset, self.size);
        }
    }
}

impl fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("segment_name", &self.segment_name)
            .field("address", &self.address)
            .field("size", &self.size)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator(capacity: u64) -> (Arc<BufferAllocator>, Arc<StorageMetrics>) {
        let metrics = Arc::new(StorageMetrics::new());
        metrics.add_capacity(capacity);
        let alloc = BufferAllocator::new("seg-1", 0x1000, capacity, metrics.clone());
        (alloc, metrics)
    }

    #[test]
    fn test_allocate_and_release() {
        let (alloc, metrics) = test_allocator(4096);

        let a = alloc.allocate(1024).unwrap();
        let b = alloc.allocate(2048).unwrap();
        assert_eq!(alloc.used(), 3072);
        assert_eq!(metrics.allocated_bytes(), 3072);
        assert_eq!(a.address(), 0x1000);
        assert_eq!(b.address(), 0x1000 + 1024);

        drop(a);
        assert_eq!(alloc.used(), 2048);
        assert_eq!(metrics.allocated_bytes(), 2048);

        drop(b);
        assert_eq!(alloc.used(), 0);
        assert_eq!(metrics.allocated_bytes(), 0);
    }

    #[test]
    fn test_never_over_allocates() {
        let (alloc, _metrics) = test_allocator(4096);

        let _a = alloc.allocate(4096).unwrap();
        assert!(alloc.allocate(1).is_none());
    }

    #[test]
    fn test_coalescing_reuses_freed_space() {
        let (alloc, _metrics) = test_allocator(4096);

        let a = alloc.allocate(1024).unwrap();
        let b = alloc.allocate(1024).unwrap();
        let c = alloc.allocate(2048).unwrap();
        drop(a);
        drop(b);
        // 2048 contiguous bytes are free again at the front
        let d = alloc.allocate(2048).unwrap();
        assert_eq!(d.address(), 0x1000);
        drop(c);
        drop(d);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_close_invalidates_handles() {
        let (alloc, metrics) = test_allocator(4096);

        let a = alloc.allocate(1024).unwrap();
        assert_eq!(a.status(), BufferStatus::Complete);

        alloc.close();
        assert_eq!(a.status(), BufferStatus::Invalid);
        assert_eq!(metrics.allocated_bytes(), 0);

        // Dropping after close must not double-subtract
        drop(a);
        assert_eq!(metrics.allocated_bytes(), 0);
        assert!(alloc.allocate(16).is_none());
    }

    #[test]
    fn test_zero_size_rejected() {
        let (alloc, _metrics) = test_allocator(4096);
        assert!(alloc.allocate(0).is_none());
    }
}
