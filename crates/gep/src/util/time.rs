//! Conversions between protocol ticks and Unix time.
//!
//! Protocol timestamps count 100 ns ticks since 0001-01-01 00:00:00 UTC.

use std::time::{SystemTime, UNIX_EPOCH};

/// Ticks per second (one tick is 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Seconds between 0001-01-01 and 1970-01-01.
pub const UNIX_EPOCH_OFFSET_SECONDS: i64 = 62_135_596_800;

/// Ticks at the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = UNIX_EPOCH_OFFSET_SECONDS * TICKS_PER_SECOND;

/// Split a tick timestamp into Unix seconds and the millisecond remainder.
pub fn to_unix_time(ticks: i64) -> (i64, u16) {
    let unix_ticks = ticks - UNIX_EPOCH_TICKS;
    let seconds = unix_ticks.div_euclid(TICKS_PER_SECOND);
    let millis = unix_ticks.rem_euclid(TICKS_PER_SECOND) / TICKS_PER_MILLISECOND;
    (seconds, millis as u16)
}

/// Build a tick timestamp from Unix seconds and milliseconds.
pub fn from_unix_time(seconds: i64, milliseconds: u16) -> i64 {
    UNIX_EPOCH_TICKS
        + seconds * TICKS_PER_SECOND
        + i64::from(milliseconds) * TICKS_PER_MILLISECOND
}

/// Current wall-clock time in ticks.
pub fn ticks_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => {
            UNIX_EPOCH_TICKS
                + elapsed.as_secs() as i64 * TICKS_PER_SECOND
                + elapsed.subsec_nanos() as i64 / 100
        }
        // Clock set before 1970; saturate at the Unix epoch.
        Err(_) => UNIX_EPOCH_TICKS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        assert_eq!(to_unix_time(UNIX_EPOCH_TICKS), (0, 0));
    }

    #[test]
    fn test_round_trip() {
        let ticks = from_unix_time(1_500_000_000, 250);
        assert_eq!(to_unix_time(ticks), (1_500_000_000, 250));
    }

    #[test]
    fn test_millisecond_remainder() {
        let ticks = UNIX_EPOCH_TICKS + 3 * TICKS_PER_SECOND + 42 * TICKS_PER_MILLISECOND;
        assert_eq!(to_unix_time(ticks), (3, 42));
    }

    #[test]
    fn test_now_is_after_2020() {
        let ticks_2020 = from_unix_time(1_577_836_800, 0); // 2020-01-01
        assert!(ticks_now() > ticks_2020);
    }
}
