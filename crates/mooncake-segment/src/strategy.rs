//! Allocator selection policy
//!
//! Given the live allocators, a strategy picks which one serves a
//! request. The only rule it must honour is replica distinctness: the
//! caller passes the segment names already used by earlier replicas of
//! the same object, and those segments are ineligible.

use crate::allocator::{AllocatedBuffer, BufferAllocator};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;

/// Policy seam for picking an allocator
pub trait AllocationStrategy: Send + Sync {
    /// Allocate `size` bytes from any eligible allocator, or `None` when
    /// no eligible allocator can satisfy the request.
    fn allocate(
        &self,
        allocators: &[&Arc<BufferAllocator>],
        size: u64,
        exclude_segments: &HashSet<String>,
    ) -> Option<AllocatedBuffer>;
}

/// Uniform-random selection among eligible allocators
#[derive(Debug, Default)]
pub struct RandomAllocationStrategy;

impl AllocationStrategy for RandomAllocationStrategy {
    fn allocate(
        &self,
        allocators: &[&Arc<BufferAllocator>],
        size: u64,
        exclude_segments: &HashSet<String>,
    ) -> Option<AllocatedBuffer> {
        let mut eligible: Vec<&Arc<BufferAllocator>> = allocators
            .iter()
            .filter(|alloc| !exclude_segments.contains(alloc.segment_name()))
            .copied()
            .collect();
        eligible.shuffle(&mut rand::thread_rng());

        // A random candidate may be full; fall through to the next one.
        eligible.into_iter().find_map(|alloc| alloc.allocate(size))
    }
}
