// Time types used across the bot.
//
// All timestamps stored on agreements are plain seconds since the unix
// epoch. They are used for deadlines, sweep scheduling and audit fields,
// never for anything that must be deterministic across processes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Seconds timestamps, used to determine the unit through the type
pub type TimestampSeconds = u64;

// Millis timestamps, used to determine the unit through the type
pub type TimestampMillis = u64;

#[inline]
pub fn get_current_time() -> Duration {
    let start = SystemTime::now();

    start
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Return timestamp in milliseconds
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
