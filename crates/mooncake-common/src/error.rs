//! Error types for the Mooncake master
//!
//! The master never throws across an RPC boundary: every operation returns
//! either a value or one of these codes. Idempotent operations translate
//! "already in target state" into success before the error escapes.

use thiserror::Error;

/// Common result type for master operations
pub type Result<T> = std::result::Result<T, Error>;

/// The closed error enumeration of the master service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("object has an unexpired lease: {0}")]
    ObjectHasLease(String),

    #[error("replica is not ready: {0}")]
    ReplicaIsNotReady(String),

    #[error("invalid write state: {0}")]
    InvalidWrite(String),

    #[error("invalid replica: {0}")]
    InvalidReplica(String),

    #[error("no available handle for {size} bytes")]
    NoAvailableHandle { size: u64 },

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("segment already exists: {0}")]
    SegmentAlreadyExists(String),

    #[error("transfer failed: {0}")]
    TransferFail(String),

    #[error("rpc failed: {0}")]
    RpcFail(String),

    #[error("operation unavailable in current mode: {0}")]
    UnavailableInCurrentMode(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// Create an invalid-params error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Stable lowercase code used in logs and the batch wire format
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "invalid_params",
            Self::ObjectNotFound(_) => "object_not_found",
            Self::ObjectAlreadyExists(_) => "object_already_exists",
            Self::ObjectHasLease(_) => "object_has_lease",
            Self::ReplicaIsNotReady(_) => "replica_is_not_ready",
            Self::InvalidWrite(_) => "invalid_write",
            Self::InvalidReplica(_) => "invalid_replica",
            Self::NoAvailableHandle { .. } => "no_available_handle",
            Self::SegmentNotFound(_) => "segment_not_found",
            Self::SegmentAlreadyExists(_) => "segment_already_exists",
            Self::TransferFail(_) => "transfer_fail",
            Self::RpcFail(_) => "rpc_fail",
            Self::UnavailableInCurrentMode(_) => "unavailable_in_current_mode",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// True for the benign races the GC worker swallows when removing
    /// objects on behalf of a reader.
    #[must_use]
    pub fn is_benign_gc_race(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::ObjectHasLease(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::ObjectNotFound("k".into()).code(), "object_not_found");
        assert_eq!(
            Error::NoAvailableHandle { size: 4096 }.code(),
            "no_available_handle"
        );
        assert_eq!(
            Error::UnavailableInCurrentMode("ping".into()).code(),
            "unavailable_in_current_mode"
        );
    }

    #[test]
    fn test_benign_gc_races() {
        assert!(Error::ObjectNotFound("k".into()).is_benign_gc_race());
        assert!(Error::ObjectHasLease("k".into()).is_benign_gc_race());
        assert!(!Error::InvalidWrite("k".into()).is_benign_gc_race());
    }
}
