// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, clamped to zero if the clock is bad.
pub fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generates a transaction guid: 64 random bits rendered as 16 lowercase hex
/// characters.
pub fn generate_guid() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}

/// Renders a path hash the way it travels on the wire: 8 lowercase hex chars.
pub fn int_to_hex_string(value: u32) -> String {
    format!("{value:08x}")
}

/// Parses a wire path hash back to its numeric form.
pub fn hex_string_to_int(value: &str) -> Option<u32> {
    u32::from_str_radix(value.trim(), 16).ok()
}
