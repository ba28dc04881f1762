//! Duration and timestamp formatting helpers.

use chrono::{DateTime, TimeZone, Utc};

/// Converts epoch seconds to a UTC datetime. Zero means unset.
pub fn timestamp_to_datetime(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    let secs = i64::try_from(secs).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Formats epoch seconds as `YYYY-MM-DDTHH:MM:SS` (UTC).
pub fn format_timestamp(secs: u64) -> Option<String> {
    timestamp_to_datetime(secs).map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Formats a duration in seconds as e.g. `1h 2m 3s`.
pub fn format_duration(secs: u64) -> String {
    let seconds = secs % 60;
    let minutes = (secs / 60) % 60;
    let hours = secs / 3600;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
