//! Wall-clock formatting.
//!
//! Scheduling everywhere else in the crate uses the monotonic clock; these
//! helpers exist only for human-readable timestamps in caller output.

use chrono::{DateTime, Local};
use std::time::SystemTime;

/// Formats the current wall-clock time as `YYYY-MM-DD HH:MM:SS.mmm`.
#[must_use]
pub fn format_now() -> String {
    format_time(SystemTime::now())
}

/// Formats a wall-clock instant as `YYYY-MM-DD HH:MM:SS.mmm`.
#[must_use]
pub fn format_time(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
