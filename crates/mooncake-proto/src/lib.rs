//! Mooncake protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for the master's
//! RPC surface.

/// Master service (object and segment coordination)
pub mod master {
    tonic::include_proto!("mooncake.master");
}
