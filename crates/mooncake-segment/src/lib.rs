//! Segment management for the Mooncake store master.
//!
//! Clients contribute pinned memory regions (*segments*) which the master
//! carves into buffer handles. This crate owns the segment registry, the
//! per-segment allocator with its RAII handle type, the allocation
//! strategy that enforces replica distinctness, and the capacity metrics
//! the eviction engine steers by.

pub mod allocator;
pub mod manager;
pub mod metrics;
pub mod strategy;

pub use allocator::{AllocatedBuffer, BufferAllocator, BufferDescriptor, BufferStatus};
pub use manager::{AllocatorAccess, MountedSegment, Segment, SegmentAccess, SegmentManager};
pub use metrics::StorageMetrics;
pub use strategy::{AllocationStrategy, RandomAllocationStrategy};
