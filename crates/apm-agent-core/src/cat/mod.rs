// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-process trust metadata: the legacy cross-application tracing (CAT)
//! header codec and the versioned distributed trace payload.
//!
//! Everything here fails soft. A header that is absent, malformed, keyed
//! differently or untrusted simply yields "no linkage" — the host
//! application never sees an error from this layer.

pub mod cross_process;
pub mod distributed;
pub mod obfuscation;

pub use cross_process::{AppData, CrossProcessState, HeaderCarrier, InboundHeaderState};
pub use distributed::DistributedTracePayload;

/// Header carrying our obfuscated cross process id on outbound requests.
pub const ID_HEADER: &str = "x-apm-id";

/// Header carrying the obfuscated transaction linkage tuple on outbound
/// requests.
pub const TRANSACTION_HEADER: &str = "x-apm-transaction";

/// Header carrying the obfuscated application data tuple on responses.
pub const APP_DATA_HEADER: &str = "x-apm-app-data";

/// Header carrying the distributed trace payload. Never obfuscated.
pub const TRACE_PAYLOAD_HEADER: &str = "x-apm-trace-payload";

/// Codec failures. These never cross the engine boundary as hard errors;
/// callers downgrade them to "no linkage" and log at debug level.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding key is not configured")]
    MissingKey,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload major version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error("untrusted account or trust key: {0}")]
    Untrusted(String),
}
