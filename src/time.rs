//! Windows FILETIME conversions.
//!
//! Directory entries carry timestamps as 100-nanosecond ticks since
//! 1601-01-01 UTC. These helpers convert to and from `chrono` UTC datetimes.

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_DELTA_SECS: i64 = 11_644_473_600;

/// Ticks (100 ns) per second.
const TICKS_PER_SEC: i64 = 10_000_000;

/// Convert a FILETIME tick count to a UTC datetime.
///
/// Returns `None` for values that fall outside chrono's representable range.
/// A zero FILETIME (the conventional "not set" marker) maps to `None`.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let ticks = i64::try_from(filetime).ok()?;
    let secs = ticks / TICKS_PER_SEC - EPOCH_DELTA_SECS;
    let nanos = (ticks % TICKS_PER_SEC) as u32 * 100;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Convert a UTC datetime to FILETIME ticks.
///
/// Datetimes before 1601-01-01 clamp to zero.
pub fn datetime_to_filetime(datetime: DateTime<Utc>) -> u64 {
    let secs = datetime.timestamp() + EPOCH_DELTA_SECS;
    if secs < 0 {
        return 0;
    }
    let sub_ticks = (datetime.timestamp_subsec_nanos() / 100) as u64;
    secs as u64 * TICKS_PER_SEC as u64 + sub_ticks
}

/// The current instant as FILETIME ticks.
pub fn filetime_now() -> u64 {
    datetime_to_filetime(Utc::now())
}
