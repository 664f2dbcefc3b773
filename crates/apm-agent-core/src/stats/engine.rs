//! The statistics merge engine and its per-application service.
//!
//! `StatsEngine` is a plain keyed map of aggregates; it is never shared
//! directly. `StatsService` owns one engine per application behind a
//! fine-grained lock, and every mutation from the outside is a merge of an
//! already-built `TransactionStats` or `StatsEngine` so the critical section
//! stays bounded by a handful of map lookups.

use crate::stats::{FnvMap, MetricId, MetricStats, TransactionStats, HARVEST_RESPONSE_TIME};
use hashbrown::HashMap;
use serde_json::json;
use std::sync::{Arc, Mutex};
use ustr::{ustr, Ustr};

/// Keyed aggregate map with commutative merge and atomic drain.
#[derive(Clone, Debug, Default)]
pub struct StatsEngine {
    metrics: FnvMap<MetricId, MetricStats>,
}

impl StatsEngine {
    pub fn new() -> Self {
        StatsEngine::default()
    }

    /// Appends one sample to the identified aggregate.
    pub fn record_data_point(&mut self, id: MetricId, value: f64) {
        self.get_or_create(id).record(value);
    }

    /// Returns a live aggregate for further mutation.
    pub fn get_or_create(&mut self, id: MetricId) -> &mut MetricStats {
        self.metrics.entry(id).or_default()
    }

    pub fn get(&self, id: &MetricId) -> Option<&MetricStats> {
        self.metrics.get(id)
    }

    pub fn size(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Combines another engine's contents key by key.
    pub fn merge(&mut self, other: StatsEngine) {
        for (id, stats) in other.metrics {
            self.metrics.entry(id).or_default().merge(&stats);
        }
    }

    /// Merges a finished transaction's scratch stats, resolving scoped
    /// entries to the transaction's final name.
    pub fn merge_transaction_stats(&mut self, stats: TransactionStats, scope: Ustr) {
        let (unscoped, scoped) = stats.into_parts();
        for (name, stats) in unscoped {
            self.metrics
                .entry(MetricId::unscoped(name))
                .or_default()
                .merge(&stats);
        }
        for (name, stats) in scoped {
            self.metrics
                .entry(MetricId::scoped(name, scope))
                .or_default()
                .merge(&stats);
        }
    }

    /// Atomically returns the current contents and resets to empty.
    pub fn drain_and_clear(&mut self) -> StatsEngine {
        StatsEngine {
            metrics: std::mem::take(&mut self.metrics),
        }
    }

    /// The harvest wire payload: `[[spec, [count, total, exclusive, min,
    /// max, sumOfSquares]], ...]`, ordered by scope then name so output is
    /// deterministic.
    pub fn metric_data(&self) -> Vec<serde_json::Value> {
        let mut entries: Vec<(&MetricId, &MetricStats)> = self.metrics.iter().collect();
        entries.sort_by(|(a, _), (b, _)| {
            let a_scope = a.scope.map(|s| s.as_str()).unwrap_or("");
            let b_scope = b.scope.map(|s| s.as_str()).unwrap_or("");
            a_scope
                .cmp(b_scope)
                .then_with(|| a.name.as_str().cmp(b.name.as_str()))
        });
        entries
            .into_iter()
            .map(|(id, stats)| json!([id.spec_json(), stats.values_json()]))
            .collect()
    }
}

/// Owns the shared harvest engines, one per application name. First
/// concurrent access to an application wins the creation race; losers use
/// the winner's engine.
#[derive(Debug, Default)]
pub struct StatsService {
    engines: Mutex<HashMap<String, Arc<Mutex<StatsEngine>>>>,
}

#[allow(clippy::expect_used)]
impl StatsService {
    pub fn new() -> Self {
        StatsService::default()
    }

    pub fn engine_for_app(&self, app_name: &str) -> Arc<Mutex<StatsEngine>> {
        let mut engines = self.engines.lock().expect("lock poisoned");
        engines
            .entry(app_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StatsEngine::new())))
            .clone()
    }

    /// The finalization merge: the only critical section on the shared
    /// engine, bounded by one lookup per recorded metric.
    pub fn merge_transaction_stats(&self, app_name: &str, stats: TransactionStats, scope: Ustr) {
        let engine = self.engine_for_app(app_name);
        let mut engine = engine.lock().expect("lock poisoned");
        engine.merge_transaction_stats(stats, scope);
    }

    /// Drains the application's engine for one harvest tick.
    pub fn harvest(&self, app_name: &str) -> StatsEngine {
        let engine = self.engine_for_app(app_name);
        let mut engine = engine.lock().expect("lock poisoned");
        engine.drain_and_clear()
    }

    /// Records the wall time one harvest tick took, reported on the next.
    pub fn record_harvest_duration(&self, app_name: &str, duration_nanos: u64) {
        let engine = self.engine_for_app(app_name);
        let mut engine = engine.lock().expect("lock poisoned");
        engine
            .get_or_create(MetricId::unscoped(ustr(HARVEST_RESPONSE_TIME)))
            .record_response_time_nanos(duration_nanos, duration_nanos);
    }

    pub fn remove_app(&self, app_name: &str) {
        let mut engines = self.engines.lock().expect("lock poisoned");
        engines.remove(app_name);
    }
}
