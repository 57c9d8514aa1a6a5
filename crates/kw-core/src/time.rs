//! Timestamps as stored in databases: UTC with millisecond precision.

use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};

/// Current time truncated to milliseconds.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A modification time strictly after `previous`, normally `now()`.
pub fn after(previous: DateTime<Utc>) -> DateTime<Utc> {
    now().max(previous + Duration::milliseconds(1))
}

/// Convert a unix timestamp, clamping out-of-range values to the epoch.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn now_is_millisecond_precision() {
        assert_eq!(now().nanosecond() % 1_000_000, 0);
    }

    #[test]
    fn after_is_strictly_later() {
        let future = now() + Duration::seconds(60);
        assert!(after(future) > future);
        let past = from_unix(0);
        assert!(after(past) > past);
    }

    #[test]
    fn from_unix_roundtrip() {
        assert_eq!(from_unix(1_700_000_000).timestamp(), 1_700_000_000);
        assert_eq!(from_unix(i64::MAX), DateTime::<Utc>::default());
    }
}
