//! Epoch-millisecond time helpers.
//!
//! All persisted timestamps in the inventory and status documents are
//! milliseconds since the UNIX epoch; human-facing copies are RFC-3339 UTC.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// The current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Format an epoch-millisecond timestamp as an RFC-3339 UTC string.
///
/// Timestamps at or below zero render as `"(never)"`, matching the monitor
/// status document's placeholder for a cache that has not yet been swept.
pub fn to_rfc3339(ms: i64) -> String {
    if ms <= 0 {
        return "(never)".to_string();
    }
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| "(invalid)".to_string())
}

/// Epoch milliseconds of the UTC midnight preceding `ms`.
pub fn midnight_utc_ms(ms: i64) -> i64 {
    const DAY_MS: i64 = 24 * 3600 * 1000;
    ms.div_euclid(DAY_MS) * DAY_MS
}
