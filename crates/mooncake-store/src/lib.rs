//! Master service core for the Mooncake distributed object store.
//!
//! The master is a metadata-only control plane: it decides where object
//! replicas live across client-contributed memory segments, tracks their
//! upload state, protects in-flight reads with leases, and reclaims
//! space through deferred GC and watermark-driven eviction. It never
//! touches payload bytes: clients transfer data out-of-band against the
//! buffer addresses the master hands out.

pub mod metadata;
pub mod metrics;
pub mod service;
mod worker;

pub use metadata::{
    MetadataStore, ObjectMetadata, Replica, ReplicaDescriptor, ReplicaStatus, N_SHARDS,
};
pub use metrics::MasterMetrics;
pub use service::{MasterService, ReplicateConfig};
