//! Timestamp encoding shared by storage and temporal queries.
//!
//! Stored timestamps use a fixed-width RFC 3339 form (UTC, microseconds, `Z`)
//! so lexicographic order in SQLite equals chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn to_storage(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses any RFC 3339 timestamp and normalizes it to UTC.
pub fn parse(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| format!("invalid timestamp `{value}`: {err}"))
}

pub fn parse_optional(value: Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    value.as_deref().map(parse).transpose()
}
