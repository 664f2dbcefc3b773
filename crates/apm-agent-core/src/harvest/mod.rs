// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The harvest cycle: periodic drain-and-transmit of aggregated telemetry.
//!
//! Every data source registers as a [`Harvestable`]. On each tick the
//! service calls `before_harvest` (an atomic drain-and-snapshot, so a tick
//! captures exactly the data produced since the previous one), ships the
//! payload through the [`ReportSender`] collaborator with bounded retries,
//! and reports the outcome back via `after_harvest` so the source can keep
//! or drop the drained data.

pub mod service;

pub use service::{HarvestHandle, HarvestService};

use crate::config::EventCategory;
use crate::sampling::{AnalyticsEvent, ReservoirManager};
use crate::stats::{StatsEngine, StatsService};
use crate::util::unix_time_millis;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Aggregated metric data for one reporting window.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricBatch {
    pub begin_millis: u64,
    pub end_millis: u64,
    pub metric_data: Vec<serde_json::Value>,
}

/// Sampled events drained from one reservoir, with the counts the collector
/// needs to compute the sampling ratio.
#[derive(Clone, Debug, PartialEq)]
pub struct EventBatch {
    pub reservoir_size: usize,
    pub events_seen: u64,
    pub events: Vec<AnalyticsEvent>,
}

/// What one harvestable produced for one tick.
#[derive(Clone, Debug)]
pub enum HarvestPayload {
    Metrics(MetricBatch),
    Events(EventBatch),
}

impl HarvestPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            HarvestPayload::Metrics(batch) => batch.metric_data.is_empty(),
            HarvestPayload::Events(batch) => batch.events.is_empty() && batch.events_seen == 0,
        }
    }
}

/// How a tick's send concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarvestOutcome {
    Sent,
    /// Every attempt in the tick's retry budget failed transiently.
    TransientFailure,
    /// The collector rejected us outright (bad credentials and the like).
    PermanentFailure,
}

/// Typed send failures returned by the sender collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent(_))
    }
}

/// The transport collaborator. The engine never talks to the network
/// itself; it hands finished batches to this trait and interprets the
/// typed result.
#[async_trait]
pub trait ReportSender: Send + Sync {
    async fn send_metric_data(&self, app_name: &str, batch: &MetricBatch)
        -> Result<(), SendError>;

    async fn send_event_data(
        &self,
        app_name: &str,
        endpoint_name: &str,
        batch: &EventBatch,
    ) -> Result<(), SendError>;
}

/// One registered harvest source. Registered at startup, invoked every
/// tick, removed at shutdown or when its application is removed.
pub trait Harvestable: Send + Sync {
    /// Collector endpoint this source reports to, e.g. `metric_data`.
    fn endpoint_name(&self) -> &str;

    fn app_name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Atomically drains the source and returns the tick's payload.
    fn before_harvest(&self) -> HarvestPayload;

    /// Informs the source how the send went so it can clear, requeue or
    /// drop the drained data.
    fn after_harvest(&self, outcome: HarvestOutcome);
}

/// Metric-data harvestable backed by the per-app stats engine. Data from a
/// failed tick is carried in `pending` and merged with the next tick's
/// drain, so nothing is double-counted and nothing is lost short of a
/// permanent failure.
pub struct StatsHarvestable {
    app_name: String,
    stats: Arc<StatsService>,
    interval: Duration,
    pending: Mutex<StatsEngine>,
    begin_millis: AtomicU64,
    end_millis: AtomicU64,
}

#[allow(clippy::expect_used)]
impl StatsHarvestable {
    pub fn new(app_name: String, stats: Arc<StatsService>, interval: Duration) -> Self {
        let now = unix_time_millis();
        StatsHarvestable {
            app_name,
            stats,
            interval,
            pending: Mutex::new(StatsEngine::new()),
            begin_millis: AtomicU64::new(now),
            end_millis: AtomicU64::new(now),
        }
    }
}

#[allow(clippy::expect_used)]
impl Harvestable for StatsHarvestable {
    fn endpoint_name(&self) -> &str {
        "metric_data"
    }

    fn app_name(&self) -> &str {
        &self.app_name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn before_harvest(&self) -> HarvestPayload {
        let started = Instant::now();
        let fresh = self.stats.harvest(&self.app_name);
        let mut pending = self.pending.lock().expect("lock poisoned");
        pending.merge(fresh);
        let end = unix_time_millis();
        self.end_millis.store(end, Ordering::Relaxed);
        let batch = MetricBatch {
            begin_millis: self.begin_millis.load(Ordering::Relaxed),
            end_millis: end,
            metric_data: pending.metric_data(),
        };
        drop(pending);
        self.stats
            .record_harvest_duration(&self.app_name, started.elapsed().as_nanos() as u64);
        HarvestPayload::Metrics(batch)
    }

    fn after_harvest(&self, outcome: HarvestOutcome) {
        match outcome {
            HarvestOutcome::Sent => {
                let mut pending = self.pending.lock().expect("lock poisoned");
                pending.drain_and_clear();
                self.begin_millis
                    .store(self.end_millis.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            // Keep pending; the next tick merges and resends it.
            HarvestOutcome::TransientFailure => {}
            HarvestOutcome::PermanentFailure => {
                let mut pending = self.pending.lock().expect("lock poisoned");
                let lost = pending.size();
                pending.drain_and_clear();
                if lost > 0 {
                    warn!(
                        "Dropping {} aggregated metrics for {} after permanent send failure",
                        lost, self.app_name
                    );
                }
            }
        }
    }
}

/// Event harvestable backed by one reservoir category. A transiently
/// failed batch is re-offered to the live reservoir once; if the resend
/// fails again the batch is dropped and counted as lost.
pub struct EventsHarvestable {
    app_name: String,
    category: EventCategory,
    reservoirs: Arc<ReservoirManager>,
    interval: Duration,
    in_flight: Mutex<Option<EventBatch>>,
    requeued: AtomicBool,
    carry_seen: AtomicU64,
    events_lost: AtomicU64,
}

#[allow(clippy::expect_used)]
impl EventsHarvestable {
    pub fn new(
        app_name: String,
        category: EventCategory,
        reservoirs: Arc<ReservoirManager>,
        interval: Duration,
    ) -> Self {
        EventsHarvestable {
            app_name,
            category,
            reservoirs,
            interval,
            in_flight: Mutex::new(None),
            requeued: AtomicBool::new(false),
            carry_seen: AtomicU64::new(0),
            events_lost: AtomicU64::new(0),
        }
    }

    /// Events dropped after exhausting the requeue budget.
    pub fn events_lost(&self) -> u64 {
        self.events_lost.load(Ordering::Relaxed)
    }
}

#[allow(clippy::expect_used)]
impl Harvestable for EventsHarvestable {
    fn endpoint_name(&self) -> &str {
        self.category.endpoint_name()
    }

    fn app_name(&self) -> &str {
        &self.app_name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn before_harvest(&self) -> HarvestPayload {
        let (events, seen) = self.reservoirs.drain_and_clear(&self.app_name);
        let seen = seen + self.carry_seen.swap(0, Ordering::Relaxed);
        let batch = EventBatch {
            reservoir_size: events.len(),
            events_seen: seen,
            events,
        };
        *self.in_flight.lock().expect("lock poisoned") = Some(batch.clone());
        HarvestPayload::Events(batch)
    }

    fn after_harvest(&self, outcome: HarvestOutcome) {
        let batch = self.in_flight.lock().expect("lock poisoned").take();
        let Some(batch) = batch else {
            return;
        };
        match outcome {
            HarvestOutcome::Sent => {
                self.requeued.store(false, Ordering::Relaxed);
            }
            HarvestOutcome::TransientFailure => {
                if self.requeued.swap(true, Ordering::Relaxed) {
                    // Already requeued once; out of budget.
                    let lost = batch.events.len() as u64;
                    self.events_lost.fetch_add(lost, Ordering::Relaxed);
                    warn!(
                        "Dropping {} sampled events for {}/{} after repeated send failures",
                        lost,
                        self.app_name,
                        self.endpoint_name()
                    );
                } else {
                    self.carry_seen
                        .fetch_add(batch.events_seen, Ordering::Relaxed);
                    self.reservoirs.retry_all(&self.app_name, batch.events);
                }
            }
            HarvestOutcome::PermanentFailure => {
                let lost = batch.events.len() as u64;
                if lost > 0 {
                    self.events_lost.fetch_add(lost, Ordering::Relaxed);
                    warn!(
                        "Dropping {} sampled events for {}/{} after permanent send failure",
                        lost,
                        self.app_name,
                        self.endpoint_name()
                    );
                }
            }
        }
    }
}
