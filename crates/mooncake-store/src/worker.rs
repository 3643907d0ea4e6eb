//! Background workers
//!
//! Two dedicated threads owned by the master: the GC/eviction worker
//! (10 ms tick) and, in HA mode, the client liveness monitor (100 ms
//! tick). Both loop on the shared `running` flag and are joined when the
//! master is dropped; queue entries still pending at shutdown are
//! discarded.

use crate::service::MasterState;
use mooncake_common::ClientId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub(crate) const GC_QUEUE_CAPACITY: usize = 16384;
pub(crate) const PING_QUEUE_CAPACITY: usize = 4096;

const GC_TICK: Duration = Duration::from_millis(10);
const CLIENT_MONITOR_TICK: Duration = Duration::from_millis(100);

/// Deferred removal request enqueued by a reader
pub(crate) struct GcTask {
    pub key: String,
    pub ready_at: Instant,
}

impl PartialEq for GcTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.key == other.key
    }
}

impl Eq for GcTask {}

impl PartialOrd for GcTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcTask {
    /// Reversed so `BinaryHeap` pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// GC and eviction loop
pub(crate) fn gc_loop(state: Arc<MasterState>) {
    debug!("GC worker started");
    let mut pending: BinaryHeap<GcTask> = BinaryHeap::new();

    while state.running.load(AtomicOrdering::Acquire) {
        while let Some(task) = state.gc_queue.pop() {
            pending.push(task);
        }

        let now = Instant::now();
        while pending
            .peek()
            .is_some_and(|task| task.ready_at <= now)
        {
            let Some(task) = pending.pop() else { break };
            match state.remove(&task.key) {
                Ok(()) => state.metrics.inc_gc_removed_keys(),
                Err(e) if e.is_benign_gc_race() => {}
                Err(e) => warn!("GC removal of key {} failed: {e}", task.key),
            }
        }

        let used_ratio = state.metrics.get_global_used_ratio();
        let config = &state.config;
        let need_eviction = state.need_eviction.load(AtomicOrdering::Relaxed);
        if used_ratio > config.eviction_high_watermark_ratio
            || (need_eviction && config.eviction_ratio > 0.0)
        {
            let target_ratio = config.eviction_ratio.max(
                used_ratio - config.eviction_high_watermark_ratio + config.eviction_ratio,
            );
            state.batch_evict(target_ratio);
        }

        std::thread::sleep(GC_TICK);
    }

    debug!("GC worker stopped, {} tasks discarded", pending.len());
}

/// Client liveness monitor loop (HA mode)
pub(crate) fn client_monitor_loop(state: Arc<MasterState>) {
    debug!("Client monitor started");
    let ttl = Duration::from_secs(state.config.client_live_ttl_secs);
    let mut deadlines: HashMap<ClientId, Instant> = HashMap::new();

    while state.running.load(AtomicOrdering::Acquire) {
        let now = Instant::now();

        while let Some(client_id) = state.client_ping_queue.pop() {
            deadlines.insert(client_id, now + ttl);
        }

        let expired: Vec<ClientId> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline < now)
            .map(|(client_id, _)| *client_id)
            .collect();
        for client_id in &expired {
            deadlines.remove(client_id);
        }

        if !expired.is_empty() {
            expire_clients(&state, &expired);
        }

        std::thread::sleep(CLIENT_MONITOR_TICK);
    }

    debug!("Client monitor stopped");
}

/// Transition expired clients to NEED_REMOUNT and two-phase-unmount
/// their segments: prepare all, sweep invalid handles once, commit all.
/// The sweep runs without the client or segment lock held, mirroring
/// UnmountSegment.
fn expire_clients(state: &MasterState, expired: &[ClientId]) {
    struct PreparedUnmount {
        segment_id: mooncake_common::SegmentId,
        client_id: ClientId,
        segment_name: String,
        dec_capacity: u64,
    }

    let mut prepared: Vec<PreparedUnmount> = Vec::new();
    {
        let mut ok_clients = state.ok_clients.write();
        for client_id in expired {
            if ok_clients.remove(client_id) {
                state.metrics.dec_active_clients();
            }
            info!("Client {client_id} expired, unmounting its segments");
        }

        let mut access = state.segment_manager.segment_access();
        for client_id in expired {
            for segment in access.client_segments(*client_id) {
                match access.prepare_unmount(segment.id) {
                    Ok(dec_capacity) => prepared.push(PreparedUnmount {
                        segment_id: segment.id,
                        client_id: *client_id,
                        segment_name: segment.name,
                        dec_capacity,
                    }),
                    Err(e) => error!(
                        "Failed to prepare unmount of segment {} for expired client {client_id}: {e}",
                        segment.name
                    ),
                }
            }
        }
    }

    if prepared.is_empty() {
        return;
    }

    state.clear_invalid_handles();

    let mut access = state.segment_manager.segment_access();
    for unmount in prepared {
        access.commit_unmount(unmount.segment_id, unmount.client_id, unmount.dec_capacity);
        info!(
            "Unmounted segment {} of expired client {}",
            unmount.segment_name, unmount.client_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_task_heap_pops_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(GcTask {
            key: "late".into(),
            ready_at: now + Duration::from_millis(100),
        });
        heap.push(GcTask {
            key: "early".into(),
            ready_at: now,
        });
        heap.push(GcTask {
            key: "middle".into(),
            ready_at: now + Duration::from_millis(50),
        });

        assert_eq!(heap.pop().unwrap().key, "early");
        assert_eq!(heap.pop().unwrap().key, "middle");
        assert_eq!(heap.pop().unwrap().key, "late");
    }
}
