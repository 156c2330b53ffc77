//! Calendar-aware poll interval, written as a compact text like `1d12h`
//! or `1mo`. Months and years move with the calendar instead of counting
//! a fixed number of seconds.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid interval: {0}")]
pub struct IntervalParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval {
    span: Duration,
    months: u32,
    years: u32,
}

impl Default for PollInterval {
    fn default() -> Self {
        PollInterval {
            span: Duration::zero(),
            months: 0,
            years: 0,
        }
    }
}

impl PollInterval {
    /// True when every component is zero, meaning "never poll".
    pub fn is_empty(&self) -> bool {
        self.span.is_zero() && self.months == 0 && self.years == 0
    }

    /// `t` advanced by the calendar components first (years, then months),
    /// then by the fixed span.
    pub fn advance(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t + Months::new(self.years * 12) + Months::new(self.months) + self.span
    }

    /// Signed duration from now until `t` plus this interval. Non-positive
    /// means the interval has elapsed and a poll is due.
    pub fn until(&self, t: DateTime<Utc>) -> Duration {
        self.advance(t) - Utc::now()
    }
}

impl FromStr for PollInterval {
    type Err = IntervalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.trim().chars().collect();
        let mut interval = PollInterval::default();
        let mut i = 0;
        while i < chars.len() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i == start || i >= chars.len() {
                return Err(IntervalParseError(s.to_string()));
            }
            let n: i64 = chars[start..i]
                .iter()
                .collect::<String>()
                .parse()
                .map_err(|_| IntervalParseError(s.to_string()))?;

            // Two-character units win over their one-character prefixes:
            // "ms" is milliseconds and "mo" is months, bare "m" is minutes.
            match chars[i] {
                's' => interval.span += Duration::seconds(n),
                'h' => interval.span += Duration::hours(n),
                'd' => interval.span += Duration::days(n),
                'w' => interval.span += Duration::weeks(n),
                'y' => {
                    interval.years += u32::try_from(n)
                        .map_err(|_| IntervalParseError(s.to_string()))?;
                }
                'n' => {
                    interval.span += Duration::nanoseconds(n);
                    if chars.get(i + 1) == Some(&'s') {
                        i += 1;
                    }
                }
                'u' | 'µ' => {
                    interval.span += Duration::microseconds(n);
                    if chars.get(i + 1) == Some(&'s') {
                        i += 1;
                    }
                }
                'm' => match chars.get(i + 1) {
                    Some('s') => {
                        interval.span += Duration::milliseconds(n);
                        i += 1;
                    }
                    Some('o') => {
                        interval.months += u32::try_from(n)
                            .map_err(|_| IntervalParseError(s.to_string()))?;
                        i += 1;
                    }
                    _ => interval.span += Duration::minutes(n),
                },
                _ => return Err(IntervalParseError(s.to_string())),
            }
            i += 1;
        }
        Ok(interval)
    }
}

impl<'de> Deserialize<'de> for PollInterval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Ok(PollInterval::default());
        }
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_concatenated_components() {
        let interval: PollInterval = "1d12h30m".parse().unwrap();
        assert_eq!(interval.span, Duration::hours(36) + Duration::minutes(30));
        assert_eq!(interval.months, 0);
        assert_eq!(interval.years, 0);
    }

    #[test]
    fn disambiguates_m_units() {
        let interval: PollInterval = "5m".parse().unwrap();
        assert_eq!(interval.span, Duration::minutes(5));

        let interval: PollInterval = "5ms".parse().unwrap();
        assert_eq!(interval.span, Duration::milliseconds(5));

        let interval: PollInterval = "5mo".parse().unwrap();
        assert_eq!(interval.months, 5);
        assert!(interval.span.is_zero());
    }

    #[test]
    fn accepts_sub_second_units_with_optional_s() {
        let a: PollInterval = "100ns".parse().unwrap();
        let b: PollInterval = "100n".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.span, Duration::nanoseconds(100));

        let c: PollInterval = "7us".parse().unwrap();
        let d: PollInterval = "7µs".parse().unwrap();
        assert_eq!(c, d);
        assert_eq!(c.span, Duration::microseconds(7));
    }

    #[test]
    fn rejects_malformed_intervals() {
        assert!("12".parse::<PollInterval>().is_err());
        assert!("x12s".parse::<PollInterval>().is_err());
        assert!("12q".parse::<PollInterval>().is_err());
        assert!("1d13".parse::<PollInterval>().is_err());
    }

    #[test]
    fn rejects_oversized_calendar_counts() {
        // Larger than u32, must not wrap around.
        assert!("5000000000y".parse::<PollInterval>().is_err());
        assert!("5000000000mo".parse::<PollInterval>().is_err());
        assert_eq!(
            "4294967295y".parse::<PollInterval>().unwrap().years,
            u32::MAX
        );
    }

    #[test]
    fn zero_interval_is_empty() {
        assert!("0s".parse::<PollInterval>().unwrap().is_empty());
        assert!(PollInterval::default().is_empty());
        assert!(!"1mo".parse::<PollInterval>().unwrap().is_empty());
    }

    #[test]
    fn advances_calendar_before_fixed_span() {
        let t = Utc.with_ymd_and_hms(2025, 1, 31, 10, 0, 0).unwrap();
        let interval: PollInterval = "1mo1d".parse().unwrap();
        // Jan 31 + 1 month clamps to Feb 28, then the fixed day applies.
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(interval.advance(t), expected);

        let interval: PollInterval = "1y".parse().unwrap();
        let leap = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap();
        assert_eq!(interval.advance(leap), expected);
    }

    #[test]
    fn until_measures_against_now() {
        let interval: PollInterval = "1d".parse().unwrap();
        let remaining = interval.until(Utc::now());
        assert!(remaining > Duration::hours(23));
        assert!(remaining <= Duration::hours(24));

        // An old reference time means the poll is overdue.
        let last = Utc::now() - Duration::days(2);
        assert!(interval.until(last) < Duration::zero());
    }
}
