//! Cross-application tracing state for one transaction.
//!
//! Terminology follows the wire: the request that triggered this
//! transaction is the inbound request; its eventual response is the
//! outbound response. In between, the transaction may issue external calls,
//! each with one outbound request and one inbound response.
//!
//! Response headers are written at most once per transaction, only for a
//! trusted inbound CAT request, and writing freezes the transaction name
//! first so the name on the wire is the name that gets reported.

use crate::cat::{
    distributed, obfuscation, APP_DATA_HEADER, ID_HEADER, TRACE_PAYLOAD_HEADER, TRANSACTION_HEADER,
};
use crate::config::AgentConfig;
use crate::transactions::Transaction;
use crate::util::{hex_string_to_int, int_to_hex_string};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use ustr::ustr;

const ALTERNATE_PATH_HASH_MAX_COUNT: usize = 10;
const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Minimal header access the codec needs; implemented for plain maps and by
/// whatever carrier the instrumentation layer wraps.
pub trait HeaderCarrier {
    fn get(&self, key: &str) -> Option<&str>;
    fn set(&mut self, key: &str, value: String);
}

impl HeaderCarrier for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Decoded state of the inbound request headers, parsed once at transaction
/// start. Anything that fails to decode leaves the transaction without CAT
/// linkage.
#[derive(Debug, Default)]
pub struct InboundHeaderState {
    pub client_cross_process_id: Option<String>,
    pub referrer_guid: Option<String>,
    pub inbound_trip_id: Option<String>,
    pub referring_path_hash: Option<u32>,
    trusted: bool,
}

impl InboundHeaderState {
    pub fn parse(config: &AgentConfig, headers: &dyn HeaderCarrier) -> Self {
        let mut state = InboundHeaderState::default();
        let cat = &config.cross_process;
        if !cat.is_usable() {
            return state;
        }
        let key = cat.encoding_key.as_deref().unwrap_or_default();

        if let Some(raw) = headers.get(ID_HEADER) {
            match obfuscation::deobfuscate(raw, key) {
                Ok(id) => {
                    let account = id.split('#').next().unwrap_or_default();
                    if cat.is_trusted_account(account) {
                        state.trusted = true;
                        state.client_cross_process_id = Some(id);
                    } else {
                        debug!("Inbound id header from untrusted account {}", account);
                    }
                }
                Err(e) => debug!("Unable to decode inbound id header: {}", e),
            }
        }

        if state.trusted {
            if let Some(raw) = headers.get(TRANSACTION_HEADER) {
                match obfuscation::deobfuscate(raw, key)
                    .map_err(|e| e.to_string())
                    .and_then(|json| {
                        serde_json::from_str::<serde_json::Value>(&json).map_err(|e| e.to_string())
                    }) {
                    Ok(serde_json::Value::Array(fields)) => {
                        state.referrer_guid =
                            fields.first().and_then(|v| v.as_str()).map(str::to_string);
                        state.inbound_trip_id =
                            fields.get(2).and_then(|v| v.as_str()).map(str::to_string);
                        state.referring_path_hash = fields
                            .get(3)
                            .and_then(|v| v.as_str())
                            .and_then(hex_string_to_int);
                    }
                    Ok(_) => debug!("Inbound transaction header is not an array"),
                    Err(e) => debug!("Unable to decode inbound transaction header: {}", e),
                }
            }
        }

        state
    }

    /// True when the inbound request carried a decodable id header from a
    /// trusted account.
    pub fn is_trusted_cat_request(&self) -> bool {
        self.trusted
    }
}

/// Application data decoded from the response to an external call we made.
#[derive(Debug, Clone, PartialEq)]
pub struct AppData {
    pub cross_process_id: String,
    pub transaction_name: String,
    pub queue_time_seconds: f64,
    pub response_time_seconds: f64,
    pub content_length: i64,
    pub guid: Option<String>,
}

impl AppData {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        let fields = value.as_array()?;
        Some(AppData {
            cross_process_id: fields.first()?.as_str()?.to_string(),
            transaction_name: fields.get(1)?.as_str()?.to_string(),
            queue_time_seconds: fields.get(2)?.as_f64()?,
            response_time_seconds: fields.get(3)?.as_f64()?,
            content_length: fields.get(4)?.as_i64()?,
            guid: fields.get(5).and_then(|v| v.as_str()).map(str::to_string),
        })
    }

    /// Rollup metric name tying the external call to the callee
    /// application; backs the application map.
    pub fn rollup_metric_name(&self, host: &str) -> String {
        format!("ExternalApp/{host}/{}/all", self.cross_process_id)
    }
}

/// Per-transaction cross-process tracing state.
pub struct CrossProcessState {
    tx: Transaction,
    config: Arc<AgentConfig>,
    inbound: InboundHeaderState,
    response_done: bool,
    cat_originator: bool,
    alternate_path_hashes: BTreeSet<String>,
}

impl CrossProcessState {
    pub fn new(tx: Transaction, config: Arc<AgentConfig>) -> Self {
        CrossProcessState {
            tx,
            config,
            inbound: InboundHeaderState::default(),
            response_done: false,
            cat_originator: false,
            alternate_path_hashes: BTreeSet::new(),
        }
    }

    pub fn with_inbound_headers(
        tx: Transaction,
        config: Arc<AgentConfig>,
        headers: &dyn HeaderCarrier,
    ) -> Self {
        let inbound = InboundHeaderState::parse(&config, headers);
        CrossProcessState {
            inbound,
            ..CrossProcessState::new(tx, config)
        }
    }

    pub fn inbound(&self) -> &InboundHeaderState {
        &self.inbound
    }

    /// The trip id is non-null once this transaction is a CAT participant:
    /// either the inbound request carried one, or we originated at least
    /// one outbound CAT request (then our guid becomes the trip id).
    pub fn trip_id(&self) -> Option<String> {
        if let Some(trip) = &self.inbound.inbound_trip_id {
            return Some(trip.clone());
        }
        if self.cat_originator {
            return Some(self.tx.guid());
        }
        None
    }

    /// Sets linkage headers on an outbound request we are about to make.
    pub fn process_outbound_request_headers(&mut self, headers: &mut dyn HeaderCarrier) {
        if self.config.distributed_tracing.enabled {
            if self.tx.is_ignored() {
                return;
            }
            if let Some(payload) = distributed::build_for_transaction(&self.config, &self.tx, None)
            {
                match payload.http_safe() {
                    Ok(text) => {
                        headers.set(TRACE_PAYLOAD_HEADER, text);
                        self.cat_originator = true;
                    }
                    Err(e) => debug!("Unable to encode distributed trace payload: {}", e),
                }
            }
            return;
        }

        let cat = &self.config.cross_process;
        if !cat.is_usable() || self.tx.is_ignored() {
            return;
        }
        let (Some(cross_process_id), Some(key)) =
            (cat.cross_process_id.clone(), cat.encoding_key.clone())
        else {
            debug!("Cross process id not configured; not setting request headers");
            return;
        };

        // Mark ourselves an originator before computing the trip id so an
        // origin transaction propagates its own guid.
        self.cat_originator = true;
        let path_hash = self.generate_path_hash();
        let transaction_json = json!([
            self.tx.guid(),
            false,
            self.trip_id(),
            int_to_hex_string(path_hash)
        ])
        .to_string();

        match (
            obfuscation::obfuscate(&cross_process_id, &key),
            obfuscation::obfuscate(&transaction_json, &key),
        ) {
            (Ok(id_value), Ok(transaction_value)) => {
                headers.set(ID_HEADER, id_value);
                headers.set(TRANSACTION_HEADER, transaction_value);
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!("Unable to obfuscate outbound request headers: {}", e);
                self.cat_originator = false;
            }
        }
    }

    /// Writes the application data header on the outbound response. Returns
    /// whether headers were written. At most once per transaction.
    pub fn process_outbound_response_headers(
        &mut self,
        headers: &mut dyn HeaderCarrier,
        content_length: i64,
    ) -> bool {
        if self.config.distributed_tracing.enabled {
            debug!("Distributed tracing enabled; not adding response metadata");
            return false;
        }
        let cat = &self.config.cross_process;
        if !cat.is_usable() {
            debug!("Cross application tracing disabled; not adding response metadata");
            return false;
        }
        if self.response_done || self.tx.is_ignored() {
            return false;
        }
        if !self.inbound.is_trusted_cat_request() {
            debug!("Inbound request is not trusted CAT; not adding response metadata");
            return false;
        }
        let (Some(cross_process_id), Some(key)) =
            (cat.cross_process_id.clone(), cat.encoding_key.clone())
        else {
            debug!("Cross process id not configured; not adding response metadata");
            return false;
        };

        // The name is about to escape to the caller; no rename may win
        // after this point.
        self.tx.freeze_name();
        let duration_nanos = self.tx.running_duration_nanos();
        self.record_client_application_metric(duration_nanos);

        let queue_time_seconds = self.tx.queue_time_millis() as f64 / 1_000.0;
        let response_time_seconds = duration_nanos as f64 / NANOS_PER_SECOND;
        let app_data = json!([
            cross_process_id,
            self.tx.name().as_str(),
            queue_time_seconds,
            response_time_seconds,
            content_length,
            self.tx.guid(),
            false
        ])
        .to_string();

        match obfuscation::obfuscate(&app_data, &key) {
            Ok(value) => {
                headers.set(APP_DATA_HEADER, value);
                self.response_done = true;
                true
            }
            Err(e) => {
                debug!("Unable to obfuscate response metadata: {}", e);
                false
            }
        }
    }

    /// Decodes the application data header from the response to an external
    /// call. Absent, malformed or unkeyed data yields `None`.
    pub fn process_inbound_response_headers(
        &self,
        headers: &dyn HeaderCarrier,
    ) -> Option<AppData> {
        let cat = &self.config.cross_process;
        if !cat.is_usable() {
            return None;
        }
        let key = cat.encoding_key.as_deref().unwrap_or_default();
        let raw = headers.get(APP_DATA_HEADER)?;
        let decoded = match obfuscation::deobfuscate(raw, key) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Unable to decode application data header: {}", e);
                return None;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&decoded) {
            Ok(value) => value,
            Err(e) => {
                debug!("Application data header is not valid JSON: {}", e);
                return None;
            }
        };
        let app_data = AppData::from_json(&value);
        if app_data.is_none() {
            debug!("Application data header has an unexpected shape");
        }
        app_data
    }

    /// Computes the path hash for the current transaction name and records
    /// it among the alternates (bounded).
    pub fn generate_path_hash(&mut self) -> u32 {
        let hash = calculate_path_hash(
            &self.tx.app_name(),
            self.tx.name().as_str(),
            self.inbound.referring_path_hash,
        );
        if self.alternate_path_hashes.len() < ALTERNATE_PATH_HASH_MAX_COUNT {
            self.alternate_path_hashes.insert(int_to_hex_string(hash));
        }
        hash
    }

    /// Every path hash this transaction produced except the current one,
    /// sorted and comma-joined. `None` when there are no alternates.
    pub fn alternate_path_hashes(&self) -> Option<String> {
        if !self.config.cross_process.is_usable() {
            return None;
        }
        let current = int_to_hex_string(calculate_path_hash(
            &self.tx.app_name(),
            self.tx.name().as_str(),
            self.inbound.referring_path_hash,
        ));
        let alternates: Vec<&str> = self
            .alternate_path_hashes
            .iter()
            .filter(|h| **h != current)
            .map(String::as_str)
            .collect();
        if alternates.is_empty() {
            None
        } else {
            Some(alternates.join(","))
        }
    }

    fn record_client_application_metric(&self, duration_nanos: u64) {
        if let Some(client_id) = &self.inbound.client_cross_process_id {
            let name = format!("ClientApplication/{client_id}/all");
            self.tx
                .record_unscoped_response_time(ustr(&name), duration_nanos);
        }
    }
}

/// Path hash: the referring hash rotated left one bit, xor'd with the hash
/// of `"appName;transactionName"`.
pub fn calculate_path_hash(app_name: &str, transaction_name: &str, referring: Option<u32>) -> u32 {
    let rotated = referring.unwrap_or(0).rotate_left(1);
    rotated ^ string_hash(&format!("{app_name};{transaction_name}"))
}

fn string_hash(value: &str) -> u32 {
    let mut hash: u32 = 0;
    for unit in value.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(u32::from(unit));
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrossProcessConfig, DistributedTracingConfig};
    use std::collections::HashMap;

    const KEY: &str = "d67afc830dab717fd163bfcb0b8b88423e9a1a3b";

    fn cat_config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            app_name: "callee-app".to_string(),
            cross_process: CrossProcessConfig {
                enabled: true,
                encoding_key: Some(KEY.to_string()),
                cross_process_id: Some("9123#1234".to_string()),
                trusted_accounts: vec!["9123".to_string()],
            },
            ..AgentConfig::default()
        })
    }

    fn trusted_inbound_headers() -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.set(
            ID_HEADER,
            obfuscation::obfuscate("9123#6789", KEY).expect("obfuscate"),
        );
        let transaction = json!(["referrer-guid", false, "trip-id", "0000ffff"]).to_string();
        headers.set(
            TRANSACTION_HEADER,
            obfuscation::obfuscate(&transaction, KEY).expect("obfuscate"),
        );
        headers
    }

    #[test]
    fn test_inbound_state_decodes_trusted_request() {
        let config = cat_config();
        let headers = trusted_inbound_headers();
        let state = InboundHeaderState::parse(&config, &headers);
        assert!(state.is_trusted_cat_request());
        assert_eq!(state.client_cross_process_id.as_deref(), Some("9123#6789"));
        assert_eq!(state.referrer_guid.as_deref(), Some("referrer-guid"));
        assert_eq!(state.inbound_trip_id.as_deref(), Some("trip-id"));
        assert_eq!(state.referring_path_hash, Some(0xffff));
    }

    #[test]
    fn test_untrusted_account_is_ignored() {
        let config = cat_config();
        let mut headers = HashMap::new();
        headers.set(
            ID_HEADER,
            obfuscation::obfuscate("666#1", KEY).expect("obfuscate"),
        );
        let state = InboundHeaderState::parse(&config, &headers);
        assert!(!state.is_trusted_cat_request());
        assert!(state.client_cross_process_id.is_none());
    }

    #[test]
    fn test_malformed_id_header_fails_soft() {
        let config = cat_config();
        let mut headers = HashMap::new();
        headers.set(ID_HEADER, "@@not even base64@@".to_string());
        let state = InboundHeaderState::parse(&config, &headers);
        assert!(!state.is_trusted_cat_request());
    }

    #[test]
    fn test_response_header_round_trip() {
        let config = cat_config();
        let tx = Transaction::start(&config);
        tx.set_name("WebTransaction/checkout", 5);
        tx.set_queue_time_millis(1_500);
        let guid = tx.guid();

        let mut state =
            CrossProcessState::with_inbound_headers(tx, config.clone(), &trusted_inbound_headers());
        let mut response_headers = HashMap::new();
        assert!(state.process_outbound_response_headers(&mut response_headers, 2048));

        // The caller decodes it as the inbound response to its external call.
        let caller_state =
            CrossProcessState::new(Transaction::start(&config), config.clone());
        let app_data = caller_state
            .process_inbound_response_headers(&response_headers)
            .expect("app data should decode");

        assert_eq!(app_data.cross_process_id, "9123#1234");
        assert_eq!(app_data.transaction_name, "WebTransaction/checkout");
        assert!((app_data.queue_time_seconds - 1.5).abs() < 1e-9);
        assert!(app_data.response_time_seconds >= 0.0);
        assert_eq!(app_data.content_length, 2048);
        assert_eq!(app_data.guid.as_deref(), Some(guid.as_str()));
    }

    #[test]
    fn test_response_headers_written_at_most_once() {
        let config = cat_config();
        let tx = Transaction::start(&config);
        let mut state =
            CrossProcessState::with_inbound_headers(tx, config, &trusted_inbound_headers());
        let mut headers = HashMap::new();
        assert!(state.process_outbound_response_headers(&mut headers, -1));
        assert!(!state.process_outbound_response_headers(&mut headers, -1));
    }

    #[test]
    fn test_untrusted_inbound_gets_no_response_headers() {
        let config = cat_config();
        let tx = Transaction::start(&config);
        let mut state = CrossProcessState::new(tx, config);
        let mut headers = HashMap::new();
        assert!(!state.process_outbound_response_headers(&mut headers, -1));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_response_freezes_name() {
        let config = cat_config();
        let tx = Transaction::start(&config);
        tx.set_name("WebTransaction/first", 1);
        let mut state = CrossProcessState::with_inbound_headers(
            tx.clone(),
            config,
            &trusted_inbound_headers(),
        );
        let mut headers = HashMap::new();
        state.process_outbound_response_headers(&mut headers, -1);
        assert!(!tx.set_name("WebTransaction/late", 100));
    }

    #[test]
    fn test_missing_encoding_key_disables_cat() {
        let mut config = AgentConfig::default();
        config.cross_process.enabled = true;
        let config = Arc::new(config);
        let tx = Transaction::start(&config);
        let mut state = CrossProcessState::new(tx, config);
        let mut headers = HashMap::new();
        state.process_outbound_request_headers(&mut headers);
        assert!(headers.is_empty());
        assert!(!state.process_outbound_response_headers(&mut headers, -1));
    }

    #[test]
    fn test_outbound_request_headers_set_linkage() {
        let config = cat_config();
        let tx = Transaction::start(&config);
        tx.set_name("WebTransaction/origin", 1);
        let guid = tx.guid();
        let mut state = CrossProcessState::new(tx, config);

        let mut headers = HashMap::new();
        state.process_outbound_request_headers(&mut headers);

        let id = obfuscation::deobfuscate(headers.get(ID_HEADER).expect("id header"), KEY)
            .expect("deobfuscate");
        assert_eq!(id, "9123#1234");

        let transaction = obfuscation::deobfuscate(
            headers.get(TRANSACTION_HEADER).expect("transaction header"),
            KEY,
        )
        .expect("deobfuscate");
        let fields: serde_json::Value =
            serde_json::from_str(&transaction).expect("transaction json");
        assert_eq!(fields[0], guid.as_str());
        assert_eq!(fields[1], false);
        // An origin transaction propagates its own guid as the trip id.
        assert_eq!(fields[2], guid.as_str());
    }

    #[test]
    fn test_distributed_tracing_takes_over_request_headers() {
        let config = Arc::new(AgentConfig {
            distributed_tracing: DistributedTracingConfig {
                enabled: true,
                account_id: Some("12345".to_string()),
                trust_key: None,
                primary_application_id: Some("51424".to_string()),
            },
            ..(*cat_config()).clone()
        });
        let tx = Transaction::start(&config);
        let mut state = CrossProcessState::new(tx, config);

        let mut headers = HashMap::new();
        state.process_outbound_request_headers(&mut headers);
        assert!(headers.get(TRACE_PAYLOAD_HEADER).is_some());
        assert!(headers.get(ID_HEADER).is_none());

        // And responses carry no CAT metadata under distributed tracing.
        let mut response_headers = HashMap::new();
        assert!(!state.process_outbound_response_headers(&mut response_headers, -1));
    }

    #[test]
    fn test_path_hash_alternates_are_bounded_and_sorted() {
        let config = cat_config();
        let tx = Transaction::start(&config);
        let mut state = CrossProcessState::new(tx.clone(), config);

        for i in 0..20 {
            tx.set_name(&format!("WebTransaction/{i}"), i + 1);
            state.generate_path_hash();
        }
        assert!(state.alternate_path_hashes.len() <= ALTERNATE_PATH_HASH_MAX_COUNT);

        let alternates = state.alternate_path_hashes().expect("alternates");
        let parts: Vec<&str> = alternates.split(',').collect();
        let mut sorted = parts.clone();
        sorted.sort_unstable();
        assert_eq!(parts, sorted);
    }

    #[test]
    fn test_path_hash_depends_on_referring_hash() {
        let a = calculate_path_hash("app", "WebTransaction/x", None);
        let b = calculate_path_hash("app", "WebTransaction/x", Some(a));
        assert_ne!(a, b);
        // Same inputs hash identically on both sides of the wire.
        assert_eq!(a, calculate_path_hash("app", "WebTransaction/x", None));
    }
}
