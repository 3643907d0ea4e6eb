//! The master service
//!
//! One instance owns the segment registry, the sharded metadata store,
//! the GC/eviction worker and (in HA mode) the client liveness monitor.
//! Operations are short synchronous critical sections: they take at most
//! one shard mutex, and PutStart additionally takes the read side of the
//! segment lock while holding it. No operation performs I/O under a
//! lock.

use crate::metadata::{MetadataStore, ObjectMetadata, Replica, ReplicaDescriptor, ReplicaStatus};
use crate::metrics::MasterMetrics;
use crate::worker::{self, GcTask};
use crossbeam_queue::ArrayQueue;
use mooncake_common::{
    ClientId, ClientStatus, Error, MasterConfig, Result, SegmentId, ViewVersionId, MAX_SLICE_SIZE,
};
use mooncake_segment::{
    AllocationStrategy, RandomAllocationStrategy, Segment, SegmentManager, StorageMetrics,
};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Delay before a read-triggered GC task removes its object
const READ_GC_DELAY_MS: u64 = 1000;

/// Replication parameters for one PutStart
#[derive(Clone, Debug)]
pub struct ReplicateConfig {
    /// Number of replicas to allocate; each must land in segments
    /// disjoint from every other replica of the same object.
    pub replica_num: usize,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self { replica_num: 1 }
    }
}

/// Shared state behind the service handle and the worker threads
pub(crate) struct MasterState {
    pub(crate) config: MasterConfig,
    pub(crate) segment_manager: SegmentManager,
    pub(crate) store: MetadataStore,
    pub(crate) metrics: Arc<MasterMetrics>,
    strategy: Box<dyn AllocationStrategy>,
    pub(crate) gc_queue: ArrayQueue<GcTask>,
    pub(crate) client_ping_queue: ArrayQueue<ClientId>,
    pub(crate) ok_clients: RwLock<HashSet<ClientId>>,
    pub(crate) need_eviction: AtomicBool,
    pub(crate) running: AtomicBool,
    view_version: ViewVersionId,
}

/// The Mooncake master: a metadata-only coordinator for object replicas
/// placed across client-contributed segments. Dropping the service stops
/// and joins its background workers.
pub struct MasterService {
    state: Arc<MasterState>,
    gc_worker: Option<JoinHandle<()>>,
    client_monitor: Option<JoinHandle<()>>,
}

impl MasterService {
    /// Build a master and start its background workers. Fails on invalid
    /// configuration before any state exists.
    pub fn new(config: MasterConfig) -> Result<Self> {
        config.validate()?;

        let storage_metrics = Arc::new(StorageMetrics::new());
        let metrics = Arc::new(MasterMetrics::new(storage_metrics.clone()));
        let enable_ha = config.enable_ha;
        let view_version = config.view_version;

        let state = Arc::new(MasterState {
            config,
            segment_manager: SegmentManager::new(storage_metrics),
            store: MetadataStore::new(),
            metrics,
            strategy: Box::new(RandomAllocationStrategy),
            gc_queue: ArrayQueue::new(worker::GC_QUEUE_CAPACITY),
            client_ping_queue: ArrayQueue::new(worker::PING_QUEUE_CAPACITY),
            ok_clients: RwLock::new(HashSet::new()),
            need_eviction: AtomicBool::new(false),
            running: AtomicBool::new(true),
            view_version,
        });

        let gc_state = state.clone();
        let gc_worker = std::thread::Builder::new()
            .name("mooncake-gc".into())
            .spawn(move || worker::gc_loop(gc_state))
            .map_err(|e| Error::internal(format!("failed to spawn GC worker: {e}")))?;

        let client_monitor = if enable_ha {
            let monitor_state = state.clone();
            Some(
                std::thread::Builder::new()
                    .name("mooncake-client-monitor".into())
                    .spawn(move || worker::client_monitor_loop(monitor_state))
                    .map_err(|e| {
                        Error::internal(format!("failed to spawn client monitor: {e}"))
                    })?,
            )
        } else {
            None
        };

        Ok(Self {
            state,
            gc_worker: Some(gc_worker),
            client_monitor,
        })
    }

    /// Metrics counters for exposition
    #[must_use]
    pub fn metrics(&self) -> &Arc<MasterMetrics> {
        &self.state.metrics
    }

    /// Total number of objects tracked across all shards
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.state.store.key_count()
    }

    /// True iff the object exists and every replica is complete. Grants
    /// a read lease as a side effect.
    pub fn exist_key(&self, key: &str) -> Result<bool> {
        self.state.exist_key(key)
    }

    /// Per-key ExistKey over a batch; not atomic across keys
    #[must_use]
    pub fn batch_exist_key(&self, keys: &[String]) -> Vec<Result<bool>> {
        keys.iter().map(|key| self.state.exist_key(key)).collect()
    }

    /// Descriptors of every replica, gated on all-complete
    pub fn get_replica_list(&self, key: &str) -> Result<Vec<ReplicaDescriptor>> {
        self.state.get_replica_list(key)
    }

    /// Per-key GetReplicaList over a batch; not atomic across keys
    #[must_use]
    pub fn batch_get_replica_list(&self, keys: &[String]) -> Vec<Result<Vec<ReplicaDescriptor>>> {
        keys.iter()
            .map(|key| self.state.get_replica_list(key))
            .collect()
    }

    /// Allocate replica placements for a new object and enter the
    /// PROCESSING state. The caller transfers data out-of-band and then
    /// calls `put_end` (or `put_revoke` to abandon the upload).
    pub fn put_start(
        &self,
        key: &str,
        value_length: u64,
        slice_lengths: &[u64],
        config: &ReplicateConfig,
    ) -> Result<Vec<ReplicaDescriptor>> {
        self.state.put_start(key, value_length, slice_lengths, config)
    }

    /// Mark every replica complete and start the object unleased
    pub fn put_end(&self, key: &str) -> Result<()> {
        self.state.put_end(key)
    }

    /// Abandon an in-flight upload, dropping its allocations
    pub fn put_revoke(&self, key: &str) -> Result<()> {
        self.state.put_revoke(key)
    }

    /// Per-key PutStart over a batch. Length mismatches between the
    /// argument vectors fail at the offending index only.
    #[must_use]
    pub fn batch_put_start(
        &self,
        keys: &[String],
        value_lengths: &[u64],
        slice_lengths: &[Vec<u64>],
        config: &ReplicateConfig,
    ) -> Vec<Result<Vec<ReplicaDescriptor>>> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| {
                match (value_lengths.get(i), slice_lengths.get(i)) {
                    (Some(value_length), Some(slices)) => {
                        self.state.put_start(key, *value_length, slices, config)
                    }
                    _ => Err(Error::invalid_params(format!(
                        "missing value_length or slice_lengths for key index {i}"
                    ))),
                }
            })
            .collect()
    }

    /// Per-key PutEnd over a batch
    #[must_use]
    pub fn batch_put_end(&self, keys: &[String]) -> Vec<Result<()>> {
        keys.iter().map(|key| self.state.put_end(key)).collect()
    }

    /// Per-key PutRevoke over a batch
    #[must_use]
    pub fn batch_put_revoke(&self, keys: &[String]) -> Vec<Result<()>> {
        keys.iter().map(|key| self.state.put_revoke(key)).collect()
    }

    /// Remove one object. Fails while the object is leased or still
    /// uploading.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.state.remove(key)
    }

    /// Remove every object whose lease has expired; returns the count
    pub fn remove_all(&self) -> u64 {
        self.state.remove_all()
    }

    /// Schedule a deferred removal of `key` after `delay_ms`
    pub fn mark_for_gc(&self, key: &str, delay_ms: u64) -> Result<()> {
        self.state.mark_for_gc(key, delay_ms)
    }

    /// Register a client-contributed segment. Idempotent on segment id.
    pub fn mount_segment(&self, segment: Segment, client_id: ClientId) -> Result<()> {
        self.state.mount_segment(segment, client_id)
    }

    /// Tear down a segment and every object left without a valid
    /// replica. Idempotent: unmounting an absent segment is OK.
    pub fn unmount_segment(&self, segment_id: SegmentId, client_id: ClientId) -> Result<()> {
        self.state.unmount_segment(segment_id, client_id)
    }

    /// Re-register all segments of a returning client and move it back
    /// into the OK set. HA mode only; idempotent per client.
    pub fn remount_segment(&self, segments: &[Segment], client_id: ClientId) -> Result<()> {
        self.state.remount_segment(segments, client_id)
    }

    /// Every key currently tracked, across all shards
    #[must_use]
    pub fn get_all_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in self.state.store.shards() {
            let entries = shard.entries.lock();
            keys.extend(entries.keys().cloned());
        }
        keys
    }

    /// Names of all live segments
    #[must_use]
    pub fn get_all_segments(&self) -> Vec<String> {
        self.state.segment_manager.segment_access().all_segments()
    }

    /// `(used, capacity)` for the named segment
    pub fn query_segment(&self, name: &str) -> Result<(u64, u64)> {
        self.state.segment_manager.segment_access().query_segment(name)
    }

    /// Record a client heartbeat and report its status. HA mode only.
    pub fn ping(&self, client_id: ClientId) -> Result<(ViewVersionId, ClientStatus)> {
        self.state.ping(client_id)
    }

    /// Cluster identifier, if configured at startup
    pub fn get_fsdir(&self) -> Result<String> {
        if self.state.config.cluster_id.is_empty() {
            return Err(Error::invalid_params("cluster_id is not configured"));
        }
        Ok(self.state.config.cluster_id.clone())
    }
}

impl Drop for MasterService {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        if let Some(handle) = self.gc_worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.client_monitor.take() {
            let _ = handle.join();
        }
    }
}

impl MasterState {
    fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_kv_lease_ttl_ms)
    }

    pub(crate) fn exist_key(&self, key: &str) -> Result<bool> {
        let shard = self.store.shard(key);
        let mut entries = shard.entries.lock();
        let Some(metadata) = entries.get_mut(key) else {
            return Ok(false);
        };
        if let Some(status) = metadata.has_diff_rep_status(ReplicaStatus::Complete) {
            warn!("Key {key} has replica in {status} state, not ready");
            return Err(Error::ReplicaIsNotReady(key.to_string()));
        }
        // The client is likely to read next; keep the object around.
        metadata.grant_lease(self.lease_ttl(), Instant::now());
        Ok(true)
    }

    pub(crate) fn get_replica_list(&self, key: &str) -> Result<Vec<ReplicaDescriptor>> {
        let shard = self.store.shard(key);
        let mut entries = shard.entries.lock();
        let Some(metadata) = entries.get_mut(key) else {
            debug!("Key {key} not found");
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        if let Some(status) = metadata.has_diff_rep_status(ReplicaStatus::Complete) {
            warn!("Key {key} has replica in {status} state, not ready");
            return Err(Error::ReplicaIsNotReady(key.to_string()));
        }

        let descriptors = metadata.replicas.iter().map(Replica::descriptor).collect();

        if self.config.enable_gc {
            // One-shot read mode: the object goes away shortly after the
            // client has had a chance to read it.
            if let Err(e) = self.mark_for_gc(key, READ_GC_DELAY_MS) {
                warn!("Failed to schedule GC for key {key}: {e}");
            }
        } else {
            metadata.grant_lease(self.lease_ttl(), Instant::now());
        }

        Ok(descriptors)
    }

    pub(crate) fn put_start(
        &self,
        key: &str,
        value_length: u64,
        slice_lengths: &[u64],
        config: &ReplicateConfig,
    ) -> Result<Vec<ReplicaDescriptor>> {
        if key.is_empty() {
            return Err(Error::invalid_params("key must not be empty"));
        }
        if value_length == 0 {
            return Err(Error::invalid_params(format!(
                "value_length must be positive for key {key}"
            )));
        }
        if config.replica_num == 0 {
            return Err(Error::invalid_params(format!(
                "replica_num must be at least 1 for key {key}"
            )));
        }
        let mut total_length: u64 = 0;
        for (i, &slice) in slice_lengths.iter().enumerate() {
            if slice == 0 || slice > MAX_SLICE_SIZE {
                return Err(Error::invalid_params(format!(
                    "slice {i} of key {key} has invalid size {slice}"
                )));
            }
            total_length += slice;
        }
        if total_length != value_length {
            return Err(Error::invalid_params(format!(
                "slice lengths sum to {total_length}, expected {value_length} for key {key}"
            )));
        }

        let shard = self.store.shard(key);
        let mut entries = shard.entries.lock();
        if let Some(metadata) = entries.get_mut(key) {
            if !metadata.cleanup_stale_handles() {
                info!("Key {key} already exists");
                return Err(Error::ObjectAlreadyExists(key.to_string()));
            }
            // Every replica lost its backing segment; treat as absent.
            entries.remove(key);
        }

        let mut replicas = Vec::with_capacity(config.replica_num);
        {
            let access = self.segment_manager.allocator_access();
            let allocators = access.allocators();
            let mut used_segments: HashSet<String> = HashSet::new();

            for replica_idx in 0..config.replica_num {
                let mut handles = Vec::with_capacity(slice_lengths.len());
                for (slice_idx, &slice) in slice_lengths.iter().enumerate() {
                    match self.strategy.allocate(&allocators, slice, &used_segments) {
                        Some(handle) => handles.push(handle),
                        None => {
                            warn!(
                                "Allocation failed for key {key} replica {replica_idx} \
                                 slice {slice_idx} ({slice} bytes), requesting eviction"
                            );
                            // Handles granted so far are released by
                            // their destructors on return.
                            self.need_eviction.store(true, Ordering::Relaxed);
                            return Err(Error::NoAvailableHandle { size: slice });
                        }
                    }
                }
                let replica = Replica::new(handles);
                used_segments.extend(replica.segment_names().map(String::from));
                replicas.push(replica);
            }
        }

        let descriptors = replicas.iter().map(Replica::descriptor).collect();
        // No lease yet: the upload sentinel protects the object until
        // PutEnd.
        entries.insert(key.to_string(), ObjectMetadata::new(value_length, replicas));
        Ok(descriptors)
    }

    pub(crate) fn put_end(&self, key: &str) -> Result<()> {
        let shard = self.store.shard(key);
        let mut entries = shard.entries.lock();
        let Some(metadata) = entries.get_mut(key) else {
            warn!("PutEnd for unknown key {key}");
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        for replica in &mut metadata.replicas {
            replica.mark_complete();
        }
        // Unleased from here on; a reader must grant the next lease.
        metadata.set_unleased(Instant::now());
        Ok(())
    }

    pub(crate) fn put_revoke(&self, key: &str) -> Result<()> {
        let shard = self.store.shard(key);
        let mut entries = shard.entries.lock();
        let Some(metadata) = entries.get_mut(key) else {
            info!("PutRevoke for unknown key {key}");
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        if let Some(status) = metadata.has_diff_rep_status(ReplicaStatus::Processing) {
            warn!("PutRevoke for key {key} with replica in {status} state");
            return Err(Error::InvalidWrite(key.to_string()));
        }
        entries.remove(key);
        Ok(())
    }

    pub(crate) fn remove(&self, key: &str) -> Result<()> {
        let shard = self.store.shard(key);
        let mut entries = shard.entries.lock();
        let Some(metadata) = entries.get_mut(key) else {
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        if !metadata.is_lease_expired(Instant::now()) {
            return Err(Error::ObjectHasLease(key.to_string()));
        }
        if let Some(status) = metadata.has_diff_rep_status(ReplicaStatus::Complete) {
            warn!("Remove for key {key} with replica in {status} state");
            return Err(Error::ReplicaIsNotReady(key.to_string()));
        }
        entries.remove(key);
        Ok(())
    }

    pub(crate) fn remove_all(&self) -> u64 {
        let now = Instant::now();
        let mut removed: u64 = 0;
        let mut freed: u64 = 0;
        for shard in self.store.shards() {
            let mut entries = shard.entries.lock();
            entries.retain(|_, metadata| {
                if metadata.is_lease_expired(now) {
                    freed += metadata.size * metadata.replicas.len() as u64;
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        debug!("RemoveAll removed {removed} objects, {freed} bytes");
        removed
    }

    pub(crate) fn mark_for_gc(&self, key: &str, delay_ms: u64) -> Result<()> {
        let task = GcTask {
            key: key.to_string(),
            ready_at: Instant::now() + Duration::from_millis(delay_ms),
        };
        self.gc_queue.push(task).map_err(|_| {
            warn!("GC queue full, dropping task for key {key}");
            Error::internal("gc queue full")
        })
    }

    pub(crate) fn mount_segment(&self, segment: Segment, client_id: ClientId) -> Result<()> {
        let mut access = self.segment_manager.segment_access();
        if self.config.enable_ha {
            // Start liveness tracking under the segment lock and before
            // the insertion completes. Earlier, and a concurrent expiry
            // could unmount a not-yet-visible segment; later, and a full
            // queue would leave the client untracked forever.
            self.enqueue_client_ping(client_id)?;
        }
        match access.mount_segment(segment, client_id) {
            Ok(()) => Ok(()),
            Err(Error::SegmentAlreadyExists(name)) => {
                info!("Segment {name} already mounted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn unmount_segment(
        &self,
        segment_id: SegmentId,
        client_id: ClientId,
    ) -> Result<()> {
        // Phase 1: tear down the allocator but keep the shell visible.
        let dec_capacity = {
            let mut access = self.segment_manager.segment_access();
            match access.prepare_unmount(segment_id) {
                Ok(dec_capacity) => dec_capacity,
                Err(Error::SegmentNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        // Phase 2: sweep object metadata with the segment lock released.
        // Holding it would deadlock against PutStart, which takes a
        // shard mutex before requesting allocator access.
        self.clear_invalid_handles();

        // Phase 3: drop the shell.
        self.segment_manager
            .segment_access()
            .commit_unmount(segment_id, client_id, dec_capacity);
        Ok(())
    }

    pub(crate) fn remount_segment(
        &self,
        segments: &[Segment],
        client_id: ClientId,
    ) -> Result<()> {
        if !self.config.enable_ha {
            warn!("ReMountSegment is only available in HA mode");
            return Err(Error::UnavailableInCurrentMode(
                "remount requires HA mode".into(),
            ));
        }

        let mut ok_clients = self.ok_clients.write();
        if ok_clients.contains(&client_id) {
            info!("Client {client_id} already remounted");
            return Ok(());
        }

        let mut access = self.segment_manager.segment_access();
        // Same ordering rule as MountSegment: tick before the remount
        // completes, while the locks are held.
        self.enqueue_client_ping(client_id)?;
        access.remount_segments(segments, client_id)?;
        drop(access);

        ok_clients.insert(client_id);
        self.metrics.inc_active_clients();
        info!("Client {client_id} remounted {} segments", segments.len());
        Ok(())
    }

    pub(crate) fn ping(&self, client_id: ClientId) -> Result<(ViewVersionId, ClientStatus)> {
        if !self.config.enable_ha {
            warn!("Ping is only available in HA mode");
            return Err(Error::UnavailableInCurrentMode(
                "ping requires HA mode".into(),
            ));
        }
        let status = if self.ok_clients.read().contains(&client_id) {
            ClientStatus::Ok
        } else {
            ClientStatus::NeedRemount
        };
        self.enqueue_client_ping(client_id)?;
        Ok((self.view_version, status))
    }

    fn enqueue_client_ping(&self, client_id: ClientId) -> Result<()> {
        self.client_ping_queue.push(client_id).map_err(|_| {
            warn!("Client ping queue full, cannot track client {client_id}");
            Error::internal("client ping queue full")
        })
    }

    /// Prune replicas with invalid handles from every object, and drop
    /// objects with no valid replica left. Runs without the segment
    /// lock; called between the prepare and commit phases of an
    /// unmount.
    pub(crate) fn clear_invalid_handles(&self) {
        for shard in self.store.shards() {
            let mut entries = shard.entries.lock();
            entries.retain(|_, metadata| !metadata.cleanup_stale_handles());
        }
    }

    /// Evict roughly `eviction_ratio` of all objects, preferring those
    /// whose lease timed out earliest. Only complete, lease-expired
    /// objects are candidates.
    pub(crate) fn batch_evict(&self, eviction_ratio: f64) {
        let now = Instant::now();
        let shards = self.store.shards();
        let mut object_count: u64 = 0;
        let mut evicted_count: u64 = 0;
        let mut freed_bytes: u64 = 0;

        // Random starting shard so repeated passes do not always
        // pressure the same shards first.
        let start_idx = rand::thread_rng().gen_range(0..shards.len());
        for i in 0..shards.len() {
            let shard = &shards[(start_idx + i) % shards.len()];
            let mut entries = shard.entries.lock();

            object_count += entries.len() as u64;
            let ideal_evict_num =
                (object_count as f64 * eviction_ratio).ceil() as i64 - evicted_count as i64;
            if ideal_evict_num <= 0 {
                continue;
            }

            let mut candidates: Vec<Instant> = entries
                .values()
                .filter(|metadata| {
                    metadata.is_lease_expired(now)
                        && metadata.has_diff_rep_status(ReplicaStatus::Complete).is_none()
                })
                .filter_map(|metadata| metadata.lease_timeout)
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let evict_num = (ideal_evict_num as usize).min(candidates.len());
            let (_, target_timeout, _) = candidates.select_nth_unstable(evict_num - 1);
            let target_timeout = *target_timeout;

            let mut shard_evicted = 0usize;
            entries.retain(|_, metadata| {
                if shard_evicted >= evict_num {
                    return true;
                }
                let evictable = matches!(metadata.lease_timeout, Some(t) if t <= target_timeout)
                    && metadata.has_diff_rep_status(ReplicaStatus::Complete).is_none();
                if evictable {
                    freed_bytes += metadata.size * metadata.replicas.len() as u64;
                    shard_evicted += 1;
                    false
                } else {
                    true
                }
            });
            evicted_count += shard_evicted as u64;
        }

        if evicted_count > 0 {
            self.need_eviction.store(false, Ordering::Relaxed);
            self.metrics.inc_eviction_success(evicted_count, freed_bytes);
        } else {
            if object_count == 0 {
                self.need_eviction.store(false, Ordering::Relaxed);
            }
            self.metrics.inc_eviction_fail();
        }
        debug!("Eviction pass removed {evicted_count} objects, {freed_bytes} bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn master(config: MasterConfig) -> MasterService {
        MasterService::new(config).unwrap()
    }

    fn segment(name: &str, size: u64) -> Segment {
        Segment {
            id: SegmentId::new(),
            name: name.to_string(),
            base: 0x4000_0000,
            size,
        }
    }

    fn put_object(service: &MasterService, key: &str, slices: &[u64], replica_num: usize) {
        let value_length = slices.iter().sum();
        service
            .put_start(key, value_length, slices, &ReplicateConfig { replica_num })
            .unwrap();
        service.put_end(key).unwrap();
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_happy_put_get() {
        let service = master(MasterConfig::default());
        let client = ClientId::new();
        service.mount_segment(segment("s1", GIB), client).unwrap();

        let descriptors = service
            .put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 1 })
            .unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].buffers.len(), 1);
        assert_eq!(descriptors[0].buffers[0].size, 4096);
        assert_eq!(descriptors[0].buffers[0].segment_name, "s1");
        assert_eq!(descriptors[0].status, ReplicaStatus::Processing);

        service.put_end("k").unwrap();
        assert!(service.exist_key("k").unwrap());

        let replicas = service.get_replica_list("k").unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].status, ReplicaStatus::Complete);
        assert_eq!(replicas[0].buffers, descriptors[0].buffers);
    }

    #[test]
    fn test_multi_slice_sizes_concatenate() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        put_object(&service, "k", &[4096, 4096, 1024], 1);
        let replicas = service.get_replica_list("k").unwrap();
        let total: u64 = replicas[0].buffers.iter().map(|b| b.size).sum();
        assert_eq!(total, 9216);
    }

    #[test]
    fn test_put_start_validation() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();
        let config = ReplicateConfig { replica_num: 1 };

        assert!(matches!(
            service.put_start("", 4096, &[4096], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            service.put_start("k", 0, &[], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            service.put_start("k", 4096, &[2048], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            service.put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 0 }),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            service.put_start(
                "k",
                MAX_SLICE_SIZE + 1,
                &[MAX_SLICE_SIZE + 1],
                &config
            ),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_duplicate_put_start_rejected() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        let config = ReplicateConfig { replica_num: 1 };
        service.put_start("k", 4096, &[4096], &config).unwrap();
        assert!(matches!(
            service.put_start("k", 4096, &[4096], &config),
            Err(Error::ObjectAlreadyExists(_))
        ));
    }

    #[test]
    fn test_replica_distinctness() {
        let service = master(MasterConfig::default());
        let client = ClientId::new();
        for name in ["s1", "s2", "s3"] {
            service.mount_segment(segment(name, GIB), client).unwrap();
        }

        let descriptors = service
            .put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 3 })
            .unwrap();
        let segments: HashSet<&str> = descriptors
            .iter()
            .flat_map(|r| r.buffers.iter().map(|b| b.segment_name.as_str()))
            .collect();
        assert_eq!(segments.len(), 3);

        // A fourth replica has nowhere distinct to go.
        assert!(matches!(
            service.put_start("k2", 4096, &[4096], &ReplicateConfig { replica_num: 4 }),
            Err(Error::NoAvailableHandle { .. })
        ));
    }

    #[test]
    fn test_no_segment_mounted() {
        let service = master(MasterConfig::default());
        assert!(matches!(
            service.put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 1 }),
            Err(Error::NoAvailableHandle { .. })
        ));
    }

    #[test]
    fn test_put_revoke_drops_object() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        service
            .put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 1 })
            .unwrap();
        service.put_revoke("k").unwrap();
        assert!(!service.exist_key("k").unwrap());

        // Revoke after PutEnd is an invalid write
        put_object(&service, "k2", &[4096], 1);
        assert!(matches!(
            service.put_revoke("k2"),
            Err(Error::InvalidWrite(_))
        ));
    }

    #[test]
    fn test_read_before_put_end() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        service
            .put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 1 })
            .unwrap();
        assert!(matches!(
            service.exist_key("k"),
            Err(Error::ReplicaIsNotReady(_))
        ));
        assert!(matches!(
            service.get_replica_list("k"),
            Err(Error::ReplicaIsNotReady(_))
        ));
    }

    #[test]
    fn test_lease_blocks_remove() {
        let config = MasterConfig {
            default_kv_lease_ttl_ms: 300,
            ..Default::default()
        };
        let service = master(config);
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        put_object(&service, "k", &[4096], 1);
        assert!(service.exist_key("k").unwrap());

        assert!(matches!(service.remove("k"), Err(Error::ObjectHasLease(_))));
        std::thread::sleep(Duration::from_millis(400));
        service.remove("k").unwrap();
        assert!(!service.exist_key("k").unwrap());
    }

    #[test]
    fn test_remove_while_processing() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();
        service
            .put_start("k", 4096, &[4096], &ReplicateConfig { replica_num: 1 })
            .unwrap();

        // The upload sentinel counts as an unexpired lease.
        assert!(matches!(service.remove("k"), Err(Error::ObjectHasLease(_))));
    }

    #[test]
    fn test_remove_absent() {
        let service = master(MasterConfig::default());
        assert!(matches!(
            service.remove("nope"),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_remove_all_spares_leased() {
        let config = MasterConfig {
            default_kv_lease_ttl_ms: 60_000,
            ..Default::default()
        };
        let service = master(config);
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        put_object(&service, "unleased", &[4096], 1);
        put_object(&service, "leased", &[4096], 1);
        assert!(service.exist_key("leased").unwrap());

        assert_eq!(service.remove_all(), 1);
        assert_eq!(service.get_all_keys(), vec!["leased".to_string()]);
    }

    #[test]
    fn test_unmount_cascade() {
        let service = master(MasterConfig::default());
        let client = ClientId::new();
        let seg = segment("s1", GIB);
        let seg_id = seg.id;
        service.mount_segment(seg, client).unwrap();

        put_object(&service, "k", &[4096], 1);
        service.unmount_segment(seg_id, client).unwrap();

        assert!(!service.exist_key("k").unwrap());
        assert!(service.get_all_keys().is_empty());
        assert!(service.get_all_segments().is_empty());

        // Idempotent
        service.unmount_segment(seg_id, client).unwrap();
    }

    #[test]
    fn test_unmount_spares_other_segments() {
        let service = master(MasterConfig::default());
        let client = ClientId::new();
        let seg_a = segment("s1", GIB);
        let seg_a_id = seg_a.id;
        service.mount_segment(seg_a, client).unwrap();

        // k lives entirely in s1, the only segment at placement time.
        put_object(&service, "k", &[4096], 1);

        let seg_b = segment("s2", GIB);
        service.mount_segment(seg_b, client).unwrap();
        service.unmount_segment(seg_a_id, client).unwrap();

        assert!(!service.exist_key("k").unwrap());
        assert_eq!(service.get_all_segments(), vec!["s2".to_string()]);
        assert_eq!(service.metrics().storage().total_capacity(), GIB);
    }

    #[test]
    fn test_unmount_prunes_stale_replica_only() {
        let service = master(MasterConfig::default());
        let client = ClientId::new();
        let seg_a = segment("s1", GIB);
        let seg_a_id = seg_a.id;
        service.mount_segment(seg_a, client).unwrap();
        service.mount_segment(segment("s2", GIB), client).unwrap();

        // Two replicas, forced into distinct segments.
        put_object(&service, "k", &[4096], 2);

        service.unmount_segment(seg_a_id, client).unwrap();

        // The s1 replica is pruned; the object survives on s2.
        assert!(service.exist_key("k").unwrap());
        let replicas = service.get_replica_list("k").unwrap();
        assert_eq!(replicas.len(), 1);
        assert!(replicas[0]
            .buffers
            .iter()
            .all(|buffer| buffer.segment_name == "s2"));
    }

    #[test]
    fn test_mount_idempotent() {
        let service = master(MasterConfig::default());
        let client = ClientId::new();
        let seg = segment("s1", GIB);
        service.mount_segment(seg.clone(), client).unwrap();
        service.mount_segment(seg, client).unwrap();
        assert_eq!(service.get_all_segments().len(), 1);
    }

    #[test]
    fn test_query_segment() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();
        put_object(&service, "k", &[4096], 1);

        let (used, capacity) = service.query_segment("s1").unwrap();
        assert_eq!(used, 4096);
        assert_eq!(capacity, GIB);
        assert!(matches!(
            service.query_segment("missing"),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_batch_operations() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let results = service.batch_put_start(
            &keys,
            &[4096, 8192],
            &[vec![4096], vec![4096, 4096]],
            &ReplicateConfig { replica_num: 1 },
        );
        assert!(results.iter().all(Result::is_ok));

        let results = service.batch_put_end(&keys);
        assert!(results.iter().all(Result::is_ok));

        let exists = service.batch_exist_key(&keys);
        assert!(exists.iter().all(|r| *r.as_ref().unwrap()));

        let lists = service.batch_get_replica_list(&keys);
        assert_eq!(lists.len(), 2);
        assert!(lists.iter().all(Result::is_ok));
    }

    #[test]
    fn test_batch_put_start_length_mismatch() {
        let service = master(MasterConfig::default());
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        // value_lengths too short: only index 1 fails
        let results = service.batch_put_start(
            &keys,
            &[4096],
            &[vec![4096], vec![4096]],
            &ReplicateConfig { replica_num: 1 },
        );
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_eviction_under_pressure() {
        let config = MasterConfig {
            eviction_ratio: 0.1,
            eviction_high_watermark_ratio: 0.9,
            ..Default::default()
        };
        let service = master(config);
        // 100 objects of 4096 bytes exactly fill the segment.
        service
            .mount_segment(segment("s1", 100 * 4096), ClientId::new())
            .unwrap();
        for i in 0..100 {
            put_object(&service, &format!("k{i}"), &[4096], 1);
        }

        // The watermark is crossed during the put loop; the GC worker
        // must bring the population back under it within a few ticks.
        assert!(wait_until(Duration::from_secs(2), || {
            service.key_count() <= 90
        }));
        assert!(service.metrics().evicted_keys() >= 10);
    }

    #[test]
    fn test_failed_allocation_triggers_eviction() {
        let config = MasterConfig {
            eviction_ratio: 0.5,
            eviction_high_watermark_ratio: 1.0,
            ..Default::default()
        };
        let service = master(config);
        service
            .mount_segment(segment("s1", 8192), ClientId::new())
            .unwrap();
        put_object(&service, "a", &[4096], 1);
        put_object(&service, "b", &[4096], 1);

        // Full: the next allocation fails and requests eviction.
        assert!(matches!(
            service.put_start("c", 4096, &[4096], &ReplicateConfig { replica_num: 1 }),
            Err(Error::NoAvailableHandle { .. })
        ));

        // The need_eviction flag makes the next tick evict even though
        // the watermark (1.0) is never exceeded.
        assert!(wait_until(Duration::from_secs(2), || {
            service.key_count() < 2
        }));
    }

    #[test]
    fn test_gc_mode_removes_after_read() {
        let config = MasterConfig {
            enable_gc: true,
            // Zero-length leases so the polling reads below cannot keep
            // the object alive past its GC deadline.
            default_kv_lease_ttl_ms: 0,
            ..Default::default()
        };
        let service = master(config);
        service
            .mount_segment(segment("s1", GIB), ClientId::new())
            .unwrap();

        put_object(&service, "k", &[4096], 1);
        service.get_replica_list("k").unwrap();

        // Still present within the 1 s grace period.
        assert!(service.exist_key("k").unwrap());
        assert!(wait_until(Duration::from_secs(3), || {
            !service.exist_key("k").unwrap_or(true)
        }));
    }

    #[test]
    fn test_ping_requires_ha() {
        let service = master(MasterConfig::default());
        assert!(matches!(
            service.ping(ClientId::new()),
            Err(Error::UnavailableInCurrentMode(_))
        ));
        assert!(matches!(
            service.remount_segment(&[], ClientId::new()),
            Err(Error::UnavailableInCurrentMode(_))
        ));
    }

    #[test]
    fn test_ha_client_expiry_and_remount() {
        let config = MasterConfig {
            enable_ha: true,
            client_live_ttl_secs: 1,
            view_version: 7,
            ..Default::default()
        };
        let service = master(config);
        let client = ClientId::new();
        let seg = segment("s1", GIB);

        service.mount_segment(seg.clone(), client).unwrap();
        assert_eq!(service.get_all_segments(), vec!["s1".to_string()]);

        // No pings: the client expires and its segment is unmounted.
        assert!(wait_until(Duration::from_secs(3), || {
            service.get_all_segments().is_empty()
        }));

        let (view_version, status) = service.ping(client).unwrap();
        assert_eq!(view_version, 7);
        assert_eq!(status, ClientStatus::NeedRemount);

        service.remount_segment(&[seg.clone()], client).unwrap();
        let (_, status) = service.ping(client).unwrap();
        assert_eq!(status, ClientStatus::Ok);
        assert_eq!(service.get_all_segments(), vec!["s1".to_string()]);

        // Idempotent: a second identical remount changes nothing.
        service.remount_segment(&[seg], client).unwrap();
        assert_eq!(service.get_all_segments(), vec!["s1".to_string()]);
        assert_eq!(service.metrics().active_clients(), 1);
    }

    #[test]
    fn test_get_fsdir() {
        let service = master(MasterConfig::default());
        assert!(matches!(service.get_fsdir(), Err(Error::InvalidParams(_))));

        let service = master(MasterConfig {
            cluster_id: "cluster-a".into(),
            ..Default::default()
        });
        assert_eq!(service.get_fsdir().unwrap(), "cluster-a");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MasterConfig {
            eviction_ratio: 2.0,
            ..Default::default()
        };
        assert!(MasterService::new(config).is_err());
    }
}
