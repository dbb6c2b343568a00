//! Time-of-day parsing and next-fire computation.
//!
//! The fire rule is "today if strictly in the future, else tomorrow". A local
//! time that does not exist because of a DST gap is pushed forward by one hour;
//! an ambiguous one (DST fold) takes the earlier instant.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::errors::ConfigError;

/// Wall-clock time of day with second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32, second: u32) -> Result<Self, ConfigError> {
        NaiveTime::from_hms_opt(hour, minute, second)
            .map(Self)
            .ok_or_else(|| ConfigError::TimeOfDay {
                value: format!("{hour:02}:{minute:02}:{second:02}"),
            })
    }

    pub fn as_naive(self) -> NaiveTime {
        self.0
    }
}

impl Default for TimeOfDay {
    /// 07:00:01, one second after the portal opens its daily quota.
    fn default() -> Self {
        Self(NaiveTime::from_hms_opt(7, 0, 1).unwrap_or(NaiveTime::MIN))
    }
}

impl FromStr for TimeOfDay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
            .map(Self)
            .map_err(|_| ConfigError::TimeOfDay {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S"))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Next instant at which `at` occurs strictly after `now`, in `now`'s zone.
pub fn next_fire_at<Tz: TimeZone>(now: &DateTime<Tz>, at: TimeOfDay) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    if let Some(candidate) = resolve_local(&tz, today, at)
        && candidate > *now
    {
        return candidate;
    }
    let mut day = today;
    // A DST gap can swallow the target on a given day; the next day always resolves.
    for _ in 0..3 {
        let Some(next) = day.checked_add_days(Days::new(1)) else {
            break;
        };
        day = next;
        if let Some(candidate) = resolve_local(&tz, day, at)
            && candidate > *now
        {
            return candidate;
        }
    }
    now.clone() + TimeDelta::days(1)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, day: NaiveDate, at: TimeOfDay) -> Option<DateTime<Tz>> {
    let naive = day.and_time(at.as_naive());
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => {
            let shifted = naive.checked_add_signed(TimeDelta::hours(1))?;
            tz.from_local_datetime(&shifted).earliest()
        }
    }
}

/// Non-negative wait from `now` until `target`.
pub fn duration_until<Tz: TimeZone>(now: &DateTime<Tz>, target: &DateTime<Tz>) -> Duration {
    target
        .clone()
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn at(date: &str, time: &str) -> DateTime<Utc> {
        let raw = format!("{date}T{time}Z");
        DateTime::parse_from_rfc3339(&raw)
            .expect("parse instant")
            .with_timezone(&Utc)
    }

    #[test]
    fn parses_with_and_without_seconds() {
        let full: TimeOfDay = "07:00:01".parse().expect("parse full");
        let short: TimeOfDay = "07:30".parse().expect("parse short");
        assert_eq!(full.to_string(), "07:00:01");
        assert_eq!(short.to_string(), "07:30:00");
    }

    #[test]
    fn rejects_out_of_range_time() {
        let err = "24:00:00".parse::<TimeOfDay>().unwrap_err();
        assert!(matches!(err, ConfigError::TimeOfDay { .. }));
        assert!("7am".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn fires_today_when_time_is_still_ahead() {
        let now = at("2026-03-10", "06:59:59");
        let next = next_fire_at(&now, "07:00:01".parse().expect("tod"));
        assert_eq!(next, at("2026-03-10", "07:00:01"));
    }

    #[test]
    fn one_second_late_rolls_to_tomorrow() {
        let now = at("2026-03-10", "07:00:02");
        let next = next_fire_at(&now, "07:00:01".parse().expect("tod"));
        assert_eq!(next, at("2026-03-11", "07:00:01"));
    }

    #[test]
    fn exact_instant_is_not_strictly_future() {
        let now = at("2026-03-10", "07:00:01");
        let next = next_fire_at(&now, "07:00:01".parse().expect("tod"));
        assert_eq!(next, at("2026-03-11", "07:00:01"));
    }

    #[test]
    fn month_and_year_boundaries_roll_over() {
        let now = at("2026-12-31", "23:00:00");
        let next = next_fire_at(&now, "07:00:01".parse().expect("tod"));
        assert_eq!(next, at("2027-01-01", "07:00:01"));
    }

    #[test]
    fn keeps_the_callers_offset() {
        let ist = FixedOffset::east_opt(5 * 3600 + 1800).expect("offset");
        let now = ist
            .with_ymd_and_hms(2026, 3, 10, 8, 0, 0)
            .single()
            .expect("local");
        let next = next_fire_at(&now, "07:00:01".parse().expect("tod"));
        assert_eq!(next.to_rfc3339(), "2026-03-11T07:00:01+05:30");
    }

    #[test]
    fn duration_until_never_goes_negative() {
        let now = at("2026-03-10", "07:00:02");
        let earlier = at("2026-03-10", "07:00:01");
        assert_eq!(duration_until(&now, &earlier), Duration::ZERO);
        let later = at("2026-03-10", "07:00:12");
        assert_eq!(duration_until(&now, &later), Duration::from_secs(10));
    }

    #[test]
    fn serde_uses_the_display_form() {
        let tod: TimeOfDay = "07:05".parse().expect("tod");
        let json = serde_json::to_string(&tod).expect("serialize");
        assert_eq!(json, "\"07:05:00\"");
        let back: TimeOfDay = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, tod);
    }
}
