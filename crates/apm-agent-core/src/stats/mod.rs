// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric identity and aggregate types.
//!
//! A metric is identified by an interned name plus an optional scope (the
//! owning transaction's final name). Values aggregate into
//! {count, total, exclusive, min, max, sum of squares}; merging two
//! aggregates with the same identity is associative and commutative, which is
//! what lets independently-populated engines be combined in any order at
//! harvest time.

pub mod engine;

pub use engine::{StatsEngine, StatsService};

use fnv::FnvBuildHasher;
use serde_json::json;
use ustr::Ustr;

/// Map used for metric identity keys; fnv hashing is cheap for the short
/// keys on the hot path.
pub(crate) type FnvMap<K, V> = hashbrown::HashMap<K, V, FnvBuildHasher>;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Supportability metric recorded with the wall time of each harvest tick.
pub const HARVEST_RESPONSE_TIME: &str = "Supportability/Harvest/ResponseTime";

/// Identity of one aggregate: name plus optional transaction scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetricId {
    pub name: Ustr,
    pub scope: Option<Ustr>,
}

impl MetricId {
    pub fn unscoped(name: Ustr) -> Self {
        MetricId { name, scope: None }
    }

    pub fn scoped(name: Ustr, scope: Ustr) -> Self {
        MetricId {
            name,
            scope: Some(scope),
        }
    }

    /// The metric spec as it travels in the harvest payload:
    /// `{"name": ...}` or `{"scope": ..., "name": ...}`.
    pub fn spec_json(&self) -> serde_json::Value {
        match self.scope {
            Some(scope) => json!({"scope": scope.as_str(), "name": self.name.as_str()}),
            None => json!({"name": self.name.as_str()}),
        }
    }
}

/// One metric aggregate. Times are in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MetricStats {
    pub count: u64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricStats {
    /// Appends one sample where total and exclusive time coincide.
    pub fn record(&mut self, value: f64) {
        self.record_with_exclusive(value, value);
    }

    /// Appends one sample with distinct total and exclusive components.
    pub fn record_with_exclusive(&mut self, total: f64, exclusive: f64) {
        if self.count == 0 {
            self.min = total;
            self.max = total;
        } else {
            self.min = self.min.min(total);
            self.max = self.max.max(total);
        }
        self.count += 1;
        self.total += total;
        self.exclusive += exclusive;
        self.sum_of_squares += total * total;
    }

    pub fn record_response_time_nanos(&mut self, total_nanos: u64, exclusive_nanos: u64) {
        self.record_with_exclusive(
            total_nanos as f64 / NANOS_PER_SECOND,
            exclusive_nanos as f64 / NANOS_PER_SECOND,
        );
    }

    /// Folds another aggregate into this one. Merge order never matters.
    pub fn merge(&mut self, other: &MetricStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }

    /// The value array as it travels in the harvest payload.
    pub fn values_json(&self) -> serde_json::Value {
        json!([
            self.count,
            self.total,
            self.exclusive,
            self.min,
            self.max,
            self.sum_of_squares
        ])
    }
}

/// Per-activity scratch stats, written without synchronization on the tracer
/// hot path and merged into the shared engine only at transaction
/// finalization. Scoped entries are keyed by metric name alone; the scope is
/// resolved to the transaction's final name at merge time, which is how a
/// rename after data was recorded still lands under the winning name.
#[derive(Clone, Debug, Default)]
pub struct TransactionStats {
    unscoped: FnvMap<Ustr, MetricStats>,
    scoped: FnvMap<Ustr, MetricStats>,
}

impl TransactionStats {
    pub fn new() -> Self {
        TransactionStats::default()
    }

    pub fn unscoped_mut(&mut self, name: Ustr) -> &mut MetricStats {
        self.unscoped.entry(name).or_default()
    }

    pub fn scoped_mut(&mut self, name: Ustr) -> &mut MetricStats {
        self.scoped.entry(name).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.unscoped.is_empty() && self.scoped.is_empty()
    }

    /// Folds another activity's scratch stats into this one (async activity
    /// merge-back at finalization).
    pub fn merge(&mut self, other: TransactionStats) {
        for (name, stats) in other.unscoped {
            self.unscoped.entry(name).or_default().merge(&stats);
        }
        for (name, stats) in other.scoped {
            self.scoped.entry(name).or_default().merge(&stats);
        }
    }

    pub(crate) fn into_parts(self) -> (FnvMap<Ustr, MetricStats>, FnvMap<Ustr, MetricStats>) {
        (self.unscoped, self.scoped)
    }
}
