//! Saturating arithmetic between chrono timestamps and std durations.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `at + delay`, clamped to the latest representable time.
pub fn later(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - delay`, clamped to the earliest representable time.
pub fn earlier(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
