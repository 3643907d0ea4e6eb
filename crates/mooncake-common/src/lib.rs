//! Common types for the Mooncake store master service.
//!
//! This crate defines the identifier newtypes, the closed error
//! enumeration, and the startup configuration shared by the master core
//! and its RPC front-end.

pub mod config;
pub mod error;
pub mod types;

pub use config::MasterConfig;
pub use error::{Error, Result};
pub use types::{
    ClientId, ClientStatus, SegmentId, ViewVersionId, MAX_SLICE_SIZE,
};
