use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, interval, timeout};
use tracing::{debug, info, warn};

use crate::app::AppState;

/// In-flight entries and cached results older than this are evicted.
const MAX_ENTRY_AGE: Duration = Duration::from_secs(30);

/// Hard cap on the processed-result cache.
const PROCESSED_MAX_ENTRIES: usize = 256;

const HOUSEKEEPING_TICK: Duration = Duration::from_secs(5);

struct InFlightFrame {
    arrived_at: Instant,
    original_timestamp: f64,
    _permit: OwnedSemaphorePermit,
}

/// Bounded admission of frames awaiting worker results.
///
/// Each admitted frame holds one of `capacity` permits inside its in-flight
/// entry; resolving or evicting the entry frees the slot. Admission waits at
/// most `admission_timeout` for a slot and reports failure instead of
/// blocking the producer session.
pub struct FramePipeline {
    slots: Arc<Semaphore>,
    admission_timeout: Duration,
    inflight: Mutex<HashMap<u32, InFlightFrame>>,
}

impl FramePipeline {
    pub fn new(
        capacity: usize,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            admission_timeout,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a frame, returning `false` when no slot frees up within the
    /// admission timeout. Re-admitting a frame id replaces the old entry
    /// and releases its slot.
    pub async fn admit(
        &self,
        frame_id: u32,
        original_timestamp: f64,
    ) -> bool {
        let acquired =
            timeout(self.admission_timeout, self.slots.clone().acquire_owned()).await;

        let Ok(Ok(permit)) = acquired else {
            return false;
        };

        let entry = InFlightFrame {
            arrived_at: Instant::now(),
            original_timestamp,
            _permit: permit,
        };

        if self.lock().insert(frame_id, entry).is_some() {
            debug!("replaced stale in-flight entry: frame_id={frame_id}");
        }
        true
    }

    /// Removes the entry for a returned result, freeing its slot. Returns
    /// the original frame timestamp, or `None` for untracked ids.
    pub fn resolve(
        &self,
        frame_id: u32,
    ) -> Option<f64> {
        self.lock()
            .remove(&frame_id)
            .map(|entry| entry.original_timestamp)
    }

    /// Evicts entries whose worker result never arrived.
    pub fn evict_expired(
        &self,
        max_age: Duration,
    ) -> usize {
        let now = Instant::now();
        let mut inflight = self.lock();
        let before = inflight.len();
        inflight.retain(|_, entry| now.duration_since(entry.arrived_at) <= max_age);
        before.saturating_sub(inflight.len())
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, InFlightFrame>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ProcessedEntry {
    detections: Value,
    received_at: Instant,
}

/// Detection results keyed by frame id, bounded by age and entry count so
/// a long-lived worker cannot grow the broker without limit.
pub struct ProcessedFrames {
    max_entries: usize,
    max_age: Duration,
    entries: Mutex<HashMap<u32, ProcessedEntry>>,
}

impl Default for ProcessedFrames {
    fn default() -> Self {
        Self::new(PROCESSED_MAX_ENTRIES, MAX_ENTRY_AGE)
    }
}

impl ProcessedFrames {
    pub fn new(
        max_entries: usize,
        max_age: Duration,
    ) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(
        &self,
        frame_id: u32,
        detections: Value,
    ) {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| now.duration_since(entry.received_at) <= self.max_age);
        entries.insert(frame_id, ProcessedEntry { detections, received_at: now });

        while entries.len() > self.max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.received_at)
                .map(|(frame_id, _)| *frame_id)
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }

    pub fn get(
        &self,
        frame_id: u32,
    ) -> Option<Value> {
        self.lock().get(&frame_id).map(|entry| entry.detections.clone())
    }

    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.received_at) <= self.max_age);
        before.saturating_sub(entries.len())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ProcessedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic eviction for the pipeline, the result cache, and idle rate
/// windows.
pub async fn run_housekeeping(state: AppState) {
    let mut ticker = interval(HOUSEKEEPING_TICK);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("housekeeping stopping");
                break;
            }
            _ = ticker.tick() => {
                let evicted = state.pipeline.evict_expired(MAX_ENTRY_AGE);
                if evicted > 0 {
                    warn!(
                        "evicted in-flight frames without results: count={}, in_flight={}",
                        evicted,
                        state.pipeline.in_flight()
                    );
                }

                let pruned = state.processed.prune_expired();
                if pruned > 0 {
                    debug!("pruned processed results: count={pruned}");
                }

                state.limiter.prune_idle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity_then_times_out() {
        let pipeline = FramePipeline::new(2, Duration::from_millis(30));

        assert!(pipeline.admit(1, 0.1).await);
        assert!(pipeline.admit(2, 0.2).await);
        assert_eq!(pipeline.in_flight(), 2);

        let started = std::time::Instant::now();
        assert!(!pipeline.admit(3, 0.3).await);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(pipeline.in_flight(), 2);
    }

    #[tokio::test]
    async fn resolve_frees_a_slot() {
        let pipeline = FramePipeline::new(1, Duration::from_millis(30));

        assert!(pipeline.admit(1, 1.5).await);
        assert_eq!(pipeline.resolve(1), Some(1.5));
        assert!(pipeline.admit(2, 2.5).await);
        assert_eq!(pipeline.in_flight(), 1);
    }

    #[tokio::test]
    async fn resolving_unknown_frame_is_harmless() {
        let pipeline = FramePipeline::new(1, Duration::from_millis(30));
        assert_eq!(pipeline.resolve(99), None);
    }

    #[tokio::test]
    async fn readmitting_a_frame_id_replaces_the_entry() {
        let pipeline = FramePipeline::new(2, Duration::from_millis(30));

        assert!(pipeline.admit(5, 1.0).await);
        assert!(pipeline.admit(5, 2.0).await);
        assert_eq!(pipeline.in_flight(), 1);

        // the replaced entry released its permit, so a second id still fits
        assert!(pipeline.admit(6, 3.0).await);
        assert_eq!(pipeline.resolve(5), Some(2.0));
    }

    #[tokio::test]
    async fn eviction_frees_abandoned_slots() {
        let pipeline = FramePipeline::new(1, Duration::from_millis(20));

        assert!(pipeline.admit(1, 0.5).await);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(pipeline.evict_expired(Duration::from_millis(30)), 1);
        assert!(pipeline.admit(2, 0.6).await);
    }

    #[test]
    fn processed_cache_enforces_entry_cap() {
        let cache = ProcessedFrames::new(3, Duration::from_secs(30));

        for frame_id in 0..5_u32 {
            cache.insert(frame_id, json!([{"frame": frame_id}]));
        }

        assert_eq!(cache.len(), 3);
        assert!(cache.get(0).is_none());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn processed_cache_prunes_by_age() {
        let cache = ProcessedFrames::new(16, Duration::from_millis(30));

        cache.insert(1, json!([]));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(cache.prune_expired(), 1);
        assert_eq!(cache.len(), 0);
    }
}
