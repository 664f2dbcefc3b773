// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Configuration sources are applied in order (later overrides earlier):
//!
//! 1. Hard-coded defaults
//! 2. `APM_*` environment variables
//!
//! All string values are trimmed before use; values that fail to parse fall
//! back to the default and log at debug level rather than failing startup.

use serde::{Deserialize, Deserializer};
use std::env;
use std::time::Duration;
use tracing::debug;

/// Default reporting period for metric data.
pub const DEFAULT_REPORT_PERIOD: Duration = Duration::from_secs(60);

/// Default reporting period for sampled event data. Event reservoirs may run
/// on a faster cadence than metric data when the collector asks for it.
pub const DEFAULT_EVENT_REPORT_PERIOD: Duration = Duration::from_secs(60);

/// Default per-attempt timeout for a harvest send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of send attempts per harvest tick.
pub const DEFAULT_SEND_ATTEMPTS: u32 = 3;

const DEFAULT_MAX_SPAN_EVENTS: usize = 2_000;
const DEFAULT_MAX_CUSTOM_EVENTS: usize = 30_000;
const DEFAULT_MAX_ERROR_EVENTS: usize = 100;
const DEFAULT_MAX_STACK_DEPTH: usize = 1_000;
const DEFAULT_APP_NAME: &str = "unnamed-application";

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// The categories of sampled events kept in reservoirs, each with its own
/// retention limit and collector endpoint name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Span,
    Custom,
    Error,
}

impl EventCategory {
    /// The collector endpoint name for this category.
    pub fn endpoint_name(&self) -> &'static str {
        match self {
            EventCategory::Span => "span_event_data",
            EventCategory::Custom => "custom_event_data",
            EventCategory::Error => "error_event_data",
        }
    }
}

/// Per-category reservoir capacities.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventLimits {
    pub span_events: usize,
    pub custom_events: usize,
    pub error_events: usize,
}

impl Default for EventLimits {
    fn default() -> Self {
        EventLimits {
            span_events: DEFAULT_MAX_SPAN_EVENTS,
            custom_events: DEFAULT_MAX_CUSTOM_EVENTS,
            error_events: DEFAULT_MAX_ERROR_EVENTS,
        }
    }
}

impl EventLimits {
    pub fn max_samples_stored(&self, category: EventCategory) -> usize {
        match category {
            EventCategory::Span => self.span_events,
            EventCategory::Custom => self.custom_events,
            EventCategory::Error => self.error_events,
        }
    }
}

/// Cross-application tracing (CAT) configuration.
///
/// CAT needs an encoding key before any header can be written; a missing key
/// disables the feature rather than failing the transaction.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrossProcessConfig {
    pub enabled: bool,
    /// Shared per-account obfuscation key, handed down by the collector.
    pub encoding_key: Option<String>,
    /// Our own identity on the wire, `"account#application"`.
    pub cross_process_id: Option<String>,
    /// Account ids whose inbound CAT headers we honor.
    pub trusted_accounts: Vec<String>,
}

impl CrossProcessConfig {
    /// CAT can only operate with both the flag and the key present.
    pub fn is_usable(&self) -> bool {
        self.enabled && self.encoding_key.is_some()
    }

    pub fn is_trusted_account(&self, account_id: &str) -> bool {
        self.trusted_accounts.iter().any(|a| a == account_id)
    }
}

/// Distributed tracing identity. Enabling distributed tracing disables CAT.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DistributedTracingConfig {
    pub enabled: bool,
    pub account_id: Option<String>,
    /// Trust key for payload validation; falls back to the account id.
    pub trust_key: Option<String>,
    pub primary_application_id: Option<String>,
}

impl DistributedTracingConfig {
    pub fn effective_trust_key(&self) -> Option<&str> {
        self.trust_key.as_deref().or(self.account_id.as_deref())
    }
}

/// Root configuration consumed by the engine. Constructed once at startup and
/// shared behind an `Arc`; never mutated afterwards.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub app_name: String,
    pub event_limits: EventLimits,
    #[serde(deserialize_with = "deserialize_secs")]
    pub report_period: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub event_report_period: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub send_timeout: Duration,
    pub send_attempts: u32,
    /// Tracer stack depth past which new tracers become no-op sentinels.
    pub max_stack_depth: usize,
    pub cross_process: CrossProcessConfig,
    pub distributed_tracing: DistributedTracingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            app_name: DEFAULT_APP_NAME.to_string(),
            event_limits: EventLimits::default(),
            report_period: DEFAULT_REPORT_PERIOD,
            event_report_period: DEFAULT_EVENT_REPORT_PERIOD,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            send_attempts: DEFAULT_SEND_ATTEMPTS,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            cross_process: CrossProcessConfig::default(),
            distributed_tracing: DistributedTracingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `APM_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = AgentConfig::default();

        if let Some(name) = non_empty_env("APM_APP_NAME") {
            config.app_name = name;
        }
        if let Some(period) = duration_env("APM_REPORT_PERIOD_SECONDS") {
            config.report_period = period;
        }
        if let Some(period) = duration_env("APM_EVENT_REPORT_PERIOD_SECONDS") {
            config.event_report_period = period;
        }
        if let Some(key) = non_empty_env("APM_CAT_ENCODING_KEY") {
            config.cross_process.encoding_key = Some(key);
            config.cross_process.enabled = true;
        }
        if let Some(id) = non_empty_env("APM_CAT_CROSS_PROCESS_ID") {
            config.cross_process.cross_process_id = Some(id);
        }
        if let Some(accounts) = non_empty_env("APM_CAT_TRUSTED_ACCOUNTS") {
            config.cross_process.trusted_accounts = accounts
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
        }
        if let Some(account) = non_empty_env("APM_DT_ACCOUNT_ID") {
            config.distributed_tracing.account_id = Some(account);
            config.distributed_tracing.enabled = true;
        }
        if let Some(key) = non_empty_env("APM_DT_TRUST_KEY") {
            config.distributed_tracing.trust_key = Some(key);
        }
        if let Some(app_id) = non_empty_env("APM_DT_PRIMARY_APPLICATION_ID") {
            config.distributed_tracing.primary_application_id = Some(app_id);
        }

        config
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn duration_env(key: &str) -> Option<Duration> {
    let raw = non_empty_env(key)?;
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            debug!("Ignoring unparsable value for {}: {:?}", key, raw);
            None
        }
    }
}
