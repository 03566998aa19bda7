//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Utc;

/// Milliseconds in one UTC day.
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Start of the UTC day containing `timestamp_ms`.
pub fn start_of_day_millis(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(MILLIS_PER_DAY)
}

/// Convert a duration into whole milliseconds, saturating at `i64::MAX`.
pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Time left until `due_ms`, or zero when it already passed.
pub fn until(due_ms: i64, now_ms: i64) -> Duration {
    if due_ms <= now_ms {
        Duration::ZERO
    } else {
        Duration::from_millis((due_ms - now_ms) as u64)
    }
}
