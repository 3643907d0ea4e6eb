//! Capacity accounting shared between allocators and the eviction engine

use std::sync::atomic::{AtomicU64, Ordering};

/// Global capacity counters, updated by segment mount/unmount and by every
/// allocation and release. The GC worker polls `used_ratio` on each tick,
/// so all fields are plain atomics.
#[derive(Debug, Default)]
pub struct StorageMetrics {
    total_capacity: AtomicU64,
    allocated_bytes: AtomicU64,
}

impl StorageMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_capacity(&self, bytes: u64) {
        self.total_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_capacity(&self, bytes: u64) {
        self.total_capacity.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn add_allocated(&self, bytes: u64) {
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_allocated(&self, bytes: u64) {
        self.allocated_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Total bytes of mounted segment capacity
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.total_capacity.load(Ordering::Relaxed)
    }

    /// Total bytes currently handed out as buffer handles
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Allocated bytes over total capacity; 0.0 when nothing is mounted
    #[must_use]
    pub fn used_ratio(&self) -> f64 {
        let capacity = self.total_capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.allocated_bytes() as f64 / capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_ratio() {
        let metrics = StorageMetrics::new();
        assert_eq!(metrics.used_ratio(), 0.0);

        metrics.add_capacity(1000);
        metrics.add_allocated(250);
        assert!((metrics.used_ratio() - 0.25).abs() < f64::EPSILON);

        metrics.sub_allocated(250);
        assert_eq!(metrics.used_ratio(), 0.0);
    }
}
