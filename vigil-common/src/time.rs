//! Timestamp utilities
//!
//! All persisted timestamps are RFC 3339 UTC strings; quota periods are UTC
//! calendar days.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::{Error, Result};

/// Length of the digest look-back window
pub const DIGEST_WINDOW_DAYS: i64 = 7;

/// Quota period key for the given instant (`YYYY-MM-DD`, UTC)
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Start of the trailing digest window ending at `now`
pub fn digest_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(DIGEST_WINDOW_DAYS)
}

/// Fixed-width storage form (microseconds, `Z` suffix) so that stored
/// timestamps order correctly as plain strings
pub fn to_db(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRecord(format!("bad timestamp '{}': {}", value, e)))
}
