//! Master metrics
//!
//! Monotonic counters kept as plain atomics, plus the capacity gauges
//! shared with the segment allocators. The binary renders these in
//! Prometheus text format on its `/metrics` endpoint.

use mooncake_segment::StorageMetrics;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one master instance. Injected rather than global so
/// tests can run many masters side by side.
#[derive(Debug)]
pub struct MasterMetrics {
    storage: Arc<StorageMetrics>,
    eviction_success: AtomicU64,
    eviction_fail: AtomicU64,
    evicted_keys: AtomicU64,
    evicted_bytes: AtomicU64,
    gc_removed_keys: AtomicU64,
    active_clients: AtomicU64,
}

impl MasterMetrics {
    #[must_use]
    pub fn new(storage: Arc<StorageMetrics>) -> Self {
        Self {
            storage,
            eviction_success: AtomicU64::new(0),
            eviction_fail: AtomicU64::new(0),
            evicted_keys: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
            gc_removed_keys: AtomicU64::new(0),
            active_clients: AtomicU64::new(0),
        }
    }

    /// Capacity gauges maintained by the segment subsystem
    #[must_use]
    pub fn storage(&self) -> &StorageMetrics {
        &self.storage
    }

    /// Allocated bytes over mounted capacity
    #[must_use]
    pub fn get_global_used_ratio(&self) -> f64 {
        self.storage.used_ratio()
    }

    pub fn inc_eviction_success(&self, keys: u64, bytes: u64) {
        self.eviction_success.fetch_add(1, Ordering::Relaxed);
        self.evicted_keys.fetch_add(keys, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_eviction_fail(&self) {
        self.eviction_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gc_removed_keys(&self) {
        self.gc_removed_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_clients(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_clients(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn evicted_keys(&self) -> u64 {
        self.evicted_keys.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_clients(&self) -> u64 {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text format. `key_count` is
    /// sampled by the caller since it is derived from the shard maps.
    #[must_use]
    pub fn render_prometheus(&self, key_count: u64) -> String {
        let mut out = String::with_capacity(1024);

        let mut gauge = |name: &str, help: &str, value: f64| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        };

        gauge(
            "mooncake_master_key_count",
            "Number of objects tracked by the master",
            key_count as f64,
        );
        gauge(
            "mooncake_master_capacity_bytes",
            "Total mounted segment capacity",
            self.storage.total_capacity() as f64,
        );
        gauge(
            "mooncake_master_allocated_bytes",
            "Bytes currently allocated to object replicas",
            self.storage.allocated_bytes() as f64,
        );
        gauge(
            "mooncake_master_used_ratio",
            "Allocated bytes over mounted capacity",
            self.storage.used_ratio(),
        );
        gauge(
            "mooncake_master_active_clients",
            "Clients currently in the OK set",
            self.active_clients.load(Ordering::Relaxed) as f64,
        );
        gauge(
            "mooncake_master_eviction_success_total",
            "Eviction passes that removed at least one object",
            self.eviction_success.load(Ordering::Relaxed) as f64,
        );
        gauge(
            "mooncake_master_eviction_fail_total",
            "Eviction passes that removed nothing",
            self.eviction_fail.load(Ordering::Relaxed) as f64,
        );
        gauge(
            "mooncake_master_evicted_keys_total",
            "Objects removed by eviction",
            self.evicted_keys.load(Ordering::Relaxed) as f64,
        );
        gauge(
            "mooncake_master_evicted_bytes_total",
            "Bytes freed by eviction",
            self.evicted_bytes.load(Ordering::Relaxed) as f64,
        );
        gauge(
            "mooncake_master_gc_removed_keys_total",
            "Objects removed by deferred GC",
            self.gc_removed_keys.load(Ordering::Relaxed) as f64,
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_all_series() {
        let metrics = MasterMetrics::new(Arc::new(StorageMetrics::new()));
        metrics.inc_eviction_success(3, 12288);
        metrics.inc_active_clients();

        let text = metrics.render_prometheus(7);
        assert!(text.contains("mooncake_master_key_count 7"));
        assert!(text.contains("mooncake_master_evicted_keys_total 3"));
        assert!(text.contains("mooncake_master_evicted_bytes_total 12288"));
        assert!(text.contains("mooncake_master_active_clients 1"));
    }
}
