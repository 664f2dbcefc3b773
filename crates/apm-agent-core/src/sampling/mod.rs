// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Priority sampling for finished events.
//!
//! When event volume exceeds the per-cycle reporting limit, the reservoir
//! keeps the highest-priority subset seen since the last drain and counts
//! everything else as dropped, so the collector can compute an accurate
//! sampling ratio from `(retained, seen)`.

pub mod manager;
pub mod reservoir;

pub use manager::ReservoirManager;
pub use reservoir::SamplingPriorityQueue;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use ustr::Ustr;

/// Anything a reservoir can retain: carries a sampling priority assigned at
/// creation, fixed for the entry's lifetime.
pub trait PriorityAware {
    fn priority(&self) -> f32;
}

/// One sampled event: a finished span, a custom event or a traced error.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalyticsEvent {
    pub event_type: Ustr,
    pub timestamp: u64,
    pub priority: f32,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

// Events serialize flat: the intrinsic fields first, then the attributes at
// the same level, which is the shape the collector expects.
impl Serialize for AnalyticsEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.event_type.as_str())?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("priority", &self.priority)?;
        for (key, value) in &self.attributes {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl AnalyticsEvent {
    pub fn new(event_type: Ustr, timestamp: u64, priority: f32) -> Self {
        AnalyticsEvent {
            event_type,
            timestamp,
            priority,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl PriorityAware for AnalyticsEvent {
    fn priority(&self) -> f32 {
        self.priority
    }
}
