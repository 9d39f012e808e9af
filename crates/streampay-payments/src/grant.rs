//! Authorization-grant accounting: limits and the repeating intervals they
//! are scoped to.

use crate::Amount;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A grant handed to us by the authorization layer alongside an
/// outgoing-payment creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub id: Uuid,
    pub limits: Option<GrantLimits>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantLimits {
    pub receiver: Option<String>,
    pub debit_amount: Option<Amount>,
    pub receive_amount: Option<Amount>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "interval_string"
    )]
    pub interval: Option<RepeatingInterval>,
}

mod interval_string {
    use super::RepeatingInterval;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(
        interval: &Option<RepeatingInterval>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match interval {
            Some(interval) => serializer.serialize_str(&interval.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<RepeatingInterval>, D::Error> {
        let string: Option<String> = Option::deserialize(deserializer)?;
        string
            .map(|string| RepeatingInterval::from_str(&string).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum IntervalError {
    #[error("not an ISO 8601 repeating interval: {0}")]
    BadFormat(String),
    #[error("bad start timestamp: {0}")]
    BadStart(String),
    #[error("bad duration: {0}")]
    BadDuration(String),
}

/// An ISO 8601 repeating interval `R[n]/<start>/<duration>`.
///
/// `R` or `R-1` repeats forever; `Rn` runs the initial interval plus `n`
/// repetitions.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatingInterval {
    pub repetitions: Option<u32>,
    pub start: DateTime<Utc>,
    pub period: IsoDuration,
    source: String,
}

impl RepeatingInterval {
    /// The cycle containing `now`, as a half-open `[start, end)` range.
    pub fn current_cycle(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if now < self.start {
            return None;
        }
        let mut cycle_start = self.start;
        let mut cycle = 0u32;
        loop {
            let cycle_end = self.period.add_to(cycle_start);
            if cycle_end <= cycle_start {
                // Zero-length period, would loop forever
                return None;
            }
            if now < cycle_end {
                return Some((cycle_start, cycle_end));
            }
            if let Some(repetitions) = self.repetitions {
                if cycle >= repetitions {
                    return None;
                }
            }
            cycle_start = cycle_end;
            cycle += 1;
        }
    }

    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.current_cycle(now).is_some()
    }
}

impl std::fmt::Display for RepeatingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for RepeatingInterval {
    type Err = IntervalError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let mut parts = string.splitn(3, '/');
        let repeat = parts
            .next()
            .filter(|part| part.starts_with('R'))
            .ok_or_else(|| IntervalError::BadFormat(string.to_string()))?;
        let start = parts
            .next()
            .ok_or_else(|| IntervalError::BadFormat(string.to_string()))?;
        let duration = parts
            .next()
            .ok_or_else(|| IntervalError::BadFormat(string.to_string()))?;

        let repetitions = match &repeat[1..] {
            "" | "-1" => None,
            count => Some(
                count
                    .parse::<u32>()
                    .map_err(|_| IntervalError::BadFormat(string.to_string()))?,
            ),
        };
        let start = DateTime::parse_from_rfc3339(start)
            .map_err(|_| IntervalError::BadStart(start.to_string()))?
            .with_timezone(&Utc);
        let period = IsoDuration::from_str(duration)?;

        Ok(RepeatingInterval {
            repetitions,
            start,
            period,
            source: string.to_string(),
        })
    }
}

/// An ISO 8601 duration. Calendar components (years, months) shift by
/// calendar arithmetic with day clamping; the rest is fixed seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl IsoDuration {
    pub fn add_to(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let with_months = add_months(start, self.years * 12 + self.months);
        with_months
            + Duration::weeks(i64::from(self.weeks))
            + Duration::days(i64::from(self.days))
            + Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds))
    }
}

fn add_months(date: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    if months == 0 {
        return date;
    }
    let zero_based = date.year() * 12 + date.month0() as i32 + months as i32;
    let year = zero_based.div_euclid(12);
    let month0 = zero_based.rem_euclid(12) as u32;
    let day = date.day().min(days_in_month(year, month0 + 1));
    Utc.ymd(year, month0 + 1, day).and_time(date.time()).unwrap_or(date)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
    }
}

impl FromStr for IsoDuration {
    type Err = IntervalError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let body = string
            .strip_prefix('P')
            .ok_or_else(|| IntervalError::BadDuration(string.to_string()))?;
        if body.is_empty() {
            return Err(IntervalError::BadDuration(string.to_string()));
        }
        let mut duration = IsoDuration::default();
        let mut in_time = false;
        let mut number = String::new();
        for character in body.chars() {
            match character {
                'T' => in_time = true,
                digit if digit.is_ascii_digit() => number.push(digit),
                designator => {
                    let value: u32 = number
                        .parse()
                        .map_err(|_| IntervalError::BadDuration(string.to_string()))?;
                    number.clear();
                    match (designator, in_time) {
                        ('Y', false) => duration.years = value,
                        ('M', false) => duration.months = value,
                        ('W', false) => duration.weeks = value,
                        ('D', false) => duration.days = value,
                        ('H', true) => duration.hours = value,
                        ('M', true) => duration.minutes = value,
                        ('S', true) => duration.seconds = value,
                        _ => return Err(IntervalError::BadDuration(string.to_string())),
                    }
                }
            }
        }
        if !number.is_empty() {
            return Err(IntervalError::BadDuration(string.to_string()));
        }
        Ok(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        let duration = IsoDuration::from_str("P1Y2M3DT4H5M6S").unwrap();
        assert_eq!(
            duration,
            IsoDuration {
                years: 1,
                months: 2,
                weeks: 0,
                days: 3,
                hours: 4,
                minutes: 5,
                seconds: 6,
            }
        );
        assert!(IsoDuration::from_str("1M").is_err());
        assert!(IsoDuration::from_str("P").is_err());
        assert!(IsoDuration::from_str("P3").is_err());
    }

    #[test]
    fn month_arithmetic_clamps_days() {
        let end_of_january = Utc.ymd(2023, 1, 31).and_hms(12, 0, 0);
        assert_eq!(
            add_months(end_of_january, 1),
            Utc.ymd(2023, 2, 28).and_hms(12, 0, 0)
        );
        assert_eq!(
            add_months(end_of_january, 13),
            Utc.ymd(2024, 2, 29).and_hms(12, 0, 0)
        );
    }

    #[test]
    fn zero_repetition_interval_covers_only_the_first_cycle() {
        let start = Utc::now() - Duration::days(5);
        let interval = RepeatingInterval::from_str(&format!(
            "R0/{}/P1M",
            start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ))
        .unwrap();
        let now = Utc::now();
        assert!(interval.covers(now));
        let (cycle_start, cycle_end) = interval.current_cycle(now).unwrap();
        assert!(cycle_start <= now && now < cycle_end);
        // the cycle after the first is out of bounds
        assert!(!interval.covers(cycle_end + Duration::days(1)));
    }

    #[test]
    fn unbounded_interval_rolls_forward() {
        let interval = RepeatingInterval::from_str("R/2020-01-01T00:00:00Z/P1D").unwrap();
        let now = Utc.ymd(2020, 3, 15).and_hms(8, 30, 0);
        let (cycle_start, cycle_end) = interval.current_cycle(now).unwrap();
        assert_eq!(cycle_start, Utc.ymd(2020, 3, 15).and_hms(0, 0, 0));
        assert_eq!(cycle_end, Utc.ymd(2020, 3, 16).and_hms(0, 0, 0));
        assert!(!interval.covers(Utc.ymd(2019, 12, 31).and_hms(23, 59, 59)));
    }
}
