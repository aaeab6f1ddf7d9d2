//! Wall-clock helpers shared by the queue, lifecycle and schedulers.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Current wall-clock time in UTC.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a std duration to a chrono duration, saturating on overflow.
#[must_use]
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Time elapsed between `earlier` and `later`, zero if `later` is before `earlier`.
#[must_use]
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
