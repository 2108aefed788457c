//! Timestamp types used by audit records

use chrono::{DateTime, SecondsFormat, Utc};

/// Standard UTC DateTime type used across all audit-trail crates
pub type UtcDateTime = DateTime<Utc>;

/// Formats a timestamp as ISO 8601 with microseconds and a `Z` designator,
/// e.g. `2024-05-01T12:00:00.123456Z`
pub fn format_timestamp(timestamp: &UtcDateTime) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time formatted with [`format_timestamp`]
pub fn utc_now_string() -> String {
    format_timestamp(&Utc::now())
}
