//! Configuration for the Mooncake master
//!
//! All knobs are supplied at startup; `validate` rejects out-of-range
//! ratios before any worker thread is spawned.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Startup configuration for a master instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Treat reads as one-shot: schedule removal shortly after each
    /// GetReplicaList instead of granting a lease.
    pub enable_gc: bool,
    /// Lease duration granted to readers (milliseconds), used when
    /// `enable_gc` is off.
    pub default_kv_lease_ttl_ms: u64,
    /// Fraction of objects to evict per eviction pass, in [0, 1].
    pub eviction_ratio: f64,
    /// Used-capacity ratio above which eviction kicks in, in [0, 1].
    pub eviction_high_watermark_ratio: f64,
    /// Seconds a client may go without a heartbeat before it expires
    /// (HA mode).
    pub client_live_ttl_secs: u64,
    /// Enable the client liveness monitor and the remount protocol.
    pub enable_ha: bool,
    /// Cluster identifier returned by GetFsdir; empty means unset.
    pub cluster_id: String,
    /// Initial view version reported by Ping.
    pub view_version: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            enable_gc: false,
            default_kv_lease_ttl_ms: 5000,
            eviction_ratio: 0.05,
            eviction_high_watermark_ratio: 0.9,
            client_live_ttl_secs: 10,
            enable_ha: false,
            cluster_id: String::new(),
            view_version: 0,
        }
    }
}

impl MasterConfig {
    /// Validate ratio ranges. Called once at startup; failure aborts the
    /// master before any state exists.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.eviction_ratio) {
            return Err(Error::invalid_params(format!(
                "eviction_ratio must be in [0.0, 1.0], got {}",
                self.eviction_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.eviction_high_watermark_ratio) {
            return Err(Error::invalid_params(format!(
                "eviction_high_watermark_ratio must be in [0.0, 1.0], got {}",
                self.eviction_high_watermark_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MasterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_eviction_ratio() {
        let config = MasterConfig {
            eviction_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MasterConfig {
            eviction_ratio: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_watermark_ratio() {
        let config = MasterConfig {
            eviction_high_watermark_ratio: 2.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
