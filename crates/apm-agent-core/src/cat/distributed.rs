//! The versioned distributed trace payload.
//!
//! A payload is a two-key JSON document: `v` is the `[major, minor]`
//! version pair, `d` carries the trace data with short field names to keep
//! the header small. Optional fields are omitted rather than null-filled,
//! and the trust key is omitted when it matches the account id. Parsing is
//! forward compatible: unknown fields are ignored, and only a major
//! version above ours is rejected.

use crate::cat::CodecError;
use crate::config::AgentConfig;
use crate::transactions::Transaction;
use crate::util::unix_time_millis;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Payload version this engine writes; parsers accept anything with an
/// equal or lower major version.
pub const PAYLOAD_VERSION: (u32, u32) = (0, 1);

const PARENT_TYPE_APP: &str = "App";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DistributedTracePayload {
    #[serde(rename = "v")]
    pub version: (u32, u32),
    #[serde(rename = "d")]
    pub data: PayloadData,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PayloadData {
    /// Parent type: what kind of component produced this payload.
    #[serde(rename = "ty")]
    pub parent_type: String,
    #[serde(rename = "ac")]
    pub account_id: String,
    /// Omitted on the wire when identical to the account id.
    #[serde(rename = "tk", default, skip_serializing_if = "Option::is_none")]
    pub trust_key: Option<String>,
    #[serde(rename = "ap")]
    pub application_id: String,
    /// Guid of the producing transaction (or span).
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    /// Trip id shared by every hop of the trace.
    #[serde(rename = "tr")]
    pub trace_id: String,
    /// Hop depth from the trace origin.
    #[serde(rename = "de", default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(rename = "pr", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
    /// Milliseconds since the epoch at payload creation.
    #[serde(rename = "ti")]
    pub timestamp: u64,
    #[serde(rename = "ho", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "sy", default, skip_serializing_if = "Option::is_none")]
    pub synthetics: Option<SyntheticsData>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyntheticsData {
    #[serde(rename = "r")]
    pub resource_id: String,
    #[serde(rename = "j")]
    pub job_id: String,
    #[serde(rename = "m")]
    pub monitor_id: String,
}

impl DistributedTracePayload {
    /// Plain JSON text of the payload.
    pub fn text(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Base64 of the JSON text, safe for HTTP header transport.
    pub fn http_safe(&self) -> Result<String, CodecError> {
        Ok(STANDARD.encode(self.text()?))
    }

    /// Parses a payload from plain or base64 text, validating the version
    /// and, when `trust_key` is given, the producing account's trust
    /// relationship. The payload's trust key defaults to its account id.
    pub fn parse(trust_key: Option<&str>, raw: &str) -> Result<Self, CodecError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CodecError::Malformed("empty payload".to_string()));
        }
        let json_text = if raw.starts_with('{') {
            raw.to_string()
        } else {
            let decoded = STANDARD
                .decode(raw)
                .map_err(|e| CodecError::Malformed(format!("invalid base64: {e}")))?;
            String::from_utf8(decoded)
                .map_err(|e| CodecError::Malformed(format!("invalid utf-8: {e}")))?
        };

        let payload: DistributedTracePayload = serde_json::from_str(&json_text)
            .map_err(|e| CodecError::Malformed(format!("invalid payload json: {e}")))?;

        if payload.version.0 > PAYLOAD_VERSION.0 {
            return Err(CodecError::UnsupportedVersion(payload.version.0));
        }

        if let Some(expected) = trust_key {
            let payload_key = payload
                .data
                .trust_key
                .as_deref()
                .unwrap_or(&payload.data.account_id);
            if payload_key != expected {
                return Err(CodecError::Untrusted(payload_key.to_string()));
            }
        }

        Ok(payload)
    }
}

/// Builds an outbound payload for a transaction, or `None` when distributed
/// tracing is off or the identity handed down at connect time is missing.
pub fn build_for_transaction(
    config: &AgentConfig,
    tx: &Transaction,
    host: Option<String>,
) -> Option<DistributedTracePayload> {
    let dt = &config.distributed_tracing;
    if !dt.enabled {
        return None;
    }
    let (Some(account_id), Some(application_id)) =
        (dt.account_id.clone(), dt.primary_application_id.clone())
    else {
        debug!("Distributed tracing identity not configured; no payload created");
        return None;
    };
    let trust_key = dt
        .trust_key
        .clone()
        .filter(|key| Some(key.as_str()) != dt.account_id.as_deref());

    let guid = tx.guid();
    Some(DistributedTracePayload {
        version: PAYLOAD_VERSION,
        data: PayloadData {
            parent_type: PARENT_TYPE_APP.to_string(),
            account_id,
            trust_key,
            application_id,
            guid: Some(guid.clone()),
            trace_id: guid,
            depth: Some(0),
            priority: Some(tx.sampling_priority()),
            timestamp: unix_time_millis(),
            host,
            synthetics: None,
        },
    })
}
