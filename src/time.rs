//! Conversions between position ticks (100ns units, matching the host
//! media server's `PositionTicks` convention), milliseconds, and the
//! `H:MM:SS` wire format UPnP actions such as `Seek` expect.

use chrono::{NaiveTime, Timelike};
use derive_more::Display;
use log::error;
use thiserror::Error;

/// Number of position ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

#[derive(Debug, Display, Error, PartialEq, Eq, Clone)]
#[display("failed to parse time value")]
pub struct ParseTimeError;

/// Converts position ticks into whole milliseconds.
pub fn ticks_to_millis(ticks: i64) -> i64 {
    ticks / (TICKS_PER_SECOND / 1000)
}

/// Converts milliseconds into position ticks.
pub fn millis_to_ticks(millis: i64) -> i64 {
    millis * (TICKS_PER_SECOND / 1000)
}

/// Formats position ticks as `H:MM:SS`, the format UPnP `Seek`/`RelTime`
/// fields use.
pub fn ticks_to_hms(ticks: i64) -> String {
    let total_seconds = (ticks.max(0) / TICKS_PER_SECOND) as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Parses an `H:MM:SS` (or `HH:MM:SS`) string into position ticks.
pub fn hms_to_ticks(value: &str) -> Result<i64, ParseTimeError> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(ParseTimeError);
    }
    let hours: i64 = parts[0].parse().map_err(|_| ParseTimeError)?;
    let minutes: i64 = parts[1].parse().map_err(|_| ParseTimeError)?;
    let seconds: i64 = parts[2].parse().map_err(|_| ParseTimeError)?;
    if minutes >= 60 || seconds >= 60 {
        return Err(ParseTimeError);
    }
    Ok((hours * 3600 + minutes * 60 + seconds) * TICKS_PER_SECOND)
}

/// Parses a `NaiveTime` out of an `H:MM:SS` string, tolerating the
/// single-digit-hour form some renderers return for `TrackDuration`.
pub fn parse_time_from_str(time: &str) -> Result<NaiveTime, ParseTimeError> {
    let ticks = hms_to_ticks(time).map_err(|e| {
        error!("failed to parse time {}", time);
        e
    })?;
    let seconds = ticks / TICKS_PER_SECOND;
    NaiveTime::from_hms_opt((seconds / 3600) as u32 % 24, ((seconds % 3600) / 60) as u32, (seconds % 60) as u32)
        .ok_or(ParseTimeError)
}

/// Milliseconds represented by a `NaiveTime`, counted from midnight.
pub fn millis_from_naive_time(time: &NaiveTime) -> u64 {
    let hour = time.hour() as u64;
    let minutes = (hour * 60) + (time.minute() as u64);
    let seconds = (minutes * 60) + (time.second() as u64);
    (seconds * 1000) + (time.nanosecond() as u64 / 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_to_millis() {
        assert_eq!(1000, ticks_to_millis(TICKS_PER_SECOND));
        assert_eq!(1500, ticks_to_millis(TICKS_PER_SECOND + TICKS_PER_SECOND / 2));
    }

    #[test]
    fn test_millis_to_ticks_roundtrip() {
        let millis = 135_000;
        let ticks = millis_to_ticks(millis);
        assert_eq!(millis, ticks_to_millis(ticks));
    }

    #[test]
    fn test_ticks_to_hms() {
        assert_eq!("00:02:15", ticks_to_hms(135 * TICKS_PER_SECOND));
        assert_eq!("01:00:00", ticks_to_hms(3600 * TICKS_PER_SECOND));
    }

    #[test]
    fn test_hms_to_ticks_roundtrip() {
        let ticks = hms_to_ticks("0:02:15").unwrap();
        assert_eq!("00:02:15", ticks_to_hms(ticks));
    }

    #[test]
    fn test_hms_to_ticks_invalid() {
        assert_eq!(Err(ParseTimeError), hms_to_ticks("00:19"));
        assert_eq!(Err(ParseTimeError), hms_to_ticks("foo:bar:baz"));
    }
}
