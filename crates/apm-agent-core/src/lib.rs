// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process telemetry aggregation engine for an APM agent.
//!
//! The engine tracks units of work (transactions) composed of nested timed
//! operations (tracers), aggregates per-operation statistics, retains a
//! prioritized, size-bounded sample of high-value events when volume
//! exceeds reporting limits, and periodically drains everything for
//! transmission to a collector.
//!
//! # Architecture
//!
//! ```text
//! Instrumentation (external)
//!   ↓ tracer start/finish
//! Activity (tracer stack) ──→ TransactionStats (per-activity scratch)
//!   ↓ finalization                       ↓ merge under final name
//! Transaction ──────────────→ StatsService (per-app engines)
//!   ↓ sampled events                     ↓ drain
//! ReservoirManager (priority sampling)   │
//!   ↓ drain                              │
//! HarvestService ── ReportSender (external transport) ──→ collector
//! ```
//!
//! Cross-process linkage (CAT headers, distributed trace payloads) is
//! handled by the [`cat`] module orthogonally to the pipeline above.
//!
//! Nothing in the engine talks to the network or touches thread-locals.
//! The embedding process supplies the transport as a [`harvest::ReportSender`]
//! and owns context propagation through [`transactions::ActivityBinding`].

pub mod cat;
pub mod config;
pub mod harvest;
pub mod logger;
pub mod sampling;
pub mod stats;
pub mod transactions;
pub mod util;

use crate::config::{AgentConfig, EventCategory};
use crate::harvest::{
    EventsHarvestable, Harvestable, HarvestHandle, HarvestService, ReportSender, StatsHarvestable,
};
use crate::sampling::{AnalyticsEvent, ReservoirManager};
use crate::stats::StatsService;
use crate::transactions::Transaction;
use std::sync::Arc;

/// The wiring context: every service the engine is made of, constructed
/// once at startup and passed down explicitly. Single-instance-per-process
/// lifetime without ambient global state.
pub struct AgentContext {
    config: Arc<AgentConfig>,
    stats: Arc<StatsService>,
    span_reservoirs: Arc<ReservoirManager>,
    custom_reservoirs: Arc<ReservoirManager>,
    error_reservoirs: Arc<ReservoirManager>,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        let limits = &config.event_limits;
        let span_reservoirs = Arc::new(ReservoirManager::new(limits.span_events));
        let custom_reservoirs = Arc::new(ReservoirManager::new(limits.custom_events));
        let error_reservoirs = Arc::new(ReservoirManager::new(limits.error_events));
        AgentContext {
            config: Arc::new(config),
            stats: Arc::new(StatsService::new()),
            span_reservoirs,
            custom_reservoirs,
            error_reservoirs,
        }
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StatsService> {
        &self.stats
    }

    pub fn reservoirs(&self, category: EventCategory) -> &Arc<ReservoirManager> {
        match category {
            EventCategory::Span => &self.span_reservoirs,
            EventCategory::Custom => &self.custom_reservoirs,
            EventCategory::Error => &self.error_reservoirs,
        }
    }

    pub fn start_transaction(&self) -> Transaction {
        Transaction::start(&self.config)
    }

    /// Offers a sampled event for the configured application.
    pub fn record_event(&self, category: EventCategory, event: AnalyticsEvent) -> bool {
        self.reservoirs(category)
            .offer(&self.config.app_name, event)
    }

    /// Finalizes a transaction into the shared stats engines.
    pub fn finish_transaction(&self, transaction: &Transaction) -> bool {
        transaction.finish(&self.stats)
    }

    /// Builds the harvest service wired to this context's data sources,
    /// ready to be driven by `tokio::spawn(service.run())`.
    pub fn harvest_service(&self, sender: Arc<dyn ReportSender>) -> (HarvestService, HarvestHandle) {
        let (service, handle) = HarvestService::new(self.config.clone(), sender);
        for harvestable in self.default_harvestables() {
            // The service task is not running yet, so registration cannot
            // fail; the unbounded channel buffers the commands.
            let _ = handle.add_harvestable(harvestable);
        }
        (service, handle)
    }

    /// The standard harvest sources for the configured application: metric
    /// data on the report period, one event source per category on the
    /// event report period.
    pub fn default_harvestables(&self) -> Vec<Arc<dyn Harvestable>> {
        let app_name = self.config.app_name.clone();
        let mut harvestables: Vec<Arc<dyn Harvestable>> = vec![Arc::new(StatsHarvestable::new(
            app_name.clone(),
            self.stats.clone(),
            self.config.report_period,
        ))];
        for category in [
            EventCategory::Span,
            EventCategory::Custom,
            EventCategory::Error,
        ] {
            harvestables.push(Arc::new(EventsHarvestable::new(
                app_name.clone(),
                category,
                self.reservoirs(category).clone(),
                self.config.event_report_period,
            )));
        }
        harvestables
    }
}
