use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    // A wall clock set before the epoch reads as zero.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn current_unix_timestamp() -> u64 {
    since_epoch().as_secs()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Session countdown deadlines and event timestamps are kept in this unit.
/// The conversion saturates at `u64::MAX`.
pub fn current_unix_timestamp_ms() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}
