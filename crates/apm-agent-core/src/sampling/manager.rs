//! Per-application reservoir ownership.
//!
//! The manager keys one reservoir per application name. Creation under
//! concurrent first access is single-writer-wins: the losing creation is
//! discarded, never retained alongside the winner. A capacity change swaps
//! in a brand-new empty reservoir instead of resizing in place, so a drain
//! racing with the change sees either the old reservoir or the new one,
//! never a partially-resized state.

use crate::sampling::{AnalyticsEvent, SamplingPriorityQueue};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type SharedReservoir = Arc<Mutex<SamplingPriorityQueue<AnalyticsEvent>>>;

pub struct ReservoirManager {
    default_capacity: usize,
    reservoirs: Mutex<HashMap<String, SharedReservoir>>,
}

#[allow(clippy::expect_used)]
impl ReservoirManager {
    pub fn new(default_capacity: usize) -> Self {
        ReservoirManager {
            default_capacity,
            reservoirs: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    pub fn get_or_create_reservoir(&self, app_name: &str) -> SharedReservoir {
        let mut reservoirs = self.reservoirs.lock().expect("lock poisoned");
        reservoirs
            .entry(app_name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SamplingPriorityQueue::new(self.default_capacity)))
            })
            .clone()
    }

    /// Offers one event to the application's reservoir. Returns whether the
    /// event was retained.
    pub fn offer(&self, app_name: &str, event: AnalyticsEvent) -> bool {
        let reservoir = self.get_or_create_reservoir(app_name);
        let mut reservoir = reservoir.lock().expect("lock poisoned");
        reservoir.offer(event)
    }

    /// Replaces the application's reservoir with an empty one of the new
    /// capacity. Previous contents are discarded, not truncated.
    pub fn set_max_samples_stored(&self, app_name: &str, capacity: usize) {
        let reservoir = self.get_or_create_reservoir(app_name);
        let mut reservoir = reservoir.lock().expect("lock poisoned");
        let discarded = reservoir.size();
        if discarded > 0 {
            debug!(
                "Replacing reservoir for {} at new capacity {}; discarding {} buffered events",
                app_name, capacity, discarded
            );
        }
        *reservoir = SamplingPriorityQueue::new(capacity);
    }

    /// Atomically drains the application's reservoir for one harvest tick:
    /// `(entries, events seen since last drain)`.
    pub fn drain_and_clear(&self, app_name: &str) -> (Vec<AnalyticsEvent>, u64) {
        let reservoir = self.get_or_create_reservoir(app_name);
        let mut reservoir = reservoir.lock().expect("lock poisoned");
        reservoir.drain_and_clear()
    }

    /// Re-offers a drained batch whose send failed transiently.
    pub fn retry_all(&self, app_name: &str, batch: Vec<AnalyticsEvent>) {
        if batch.is_empty() {
            return;
        }
        let reservoir = self.get_or_create_reservoir(app_name);
        let mut reservoir = reservoir.lock().expect("lock poisoned");
        reservoir.retry_all(batch);
    }

    pub fn remove_app(&self, app_name: &str) {
        let mut reservoirs = self.reservoirs.lock().expect("lock poisoned");
        reservoirs.remove(app_name);
    }
}
