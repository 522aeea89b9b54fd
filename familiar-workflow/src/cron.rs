//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field one of `*`, a
//! value, a comma list, an `N-M` range, or a `*/N` / `N-M/N` / `N/N` step.
//! Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.
//!
//! All five fields must match for a time to match, including when both
//! day-of-month and day-of-week are restricted.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead `next_fire` searches before giving up.
const SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day month weekday), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct FieldRange {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldRange = FieldRange { name: "minute", min: 0, max: 59 };
const HOUR: FieldRange = FieldRange { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldRange = FieldRange { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldRange = FieldRange { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldRange = FieldRange { name: "day-of-week", min: 0, max: 7 };

/// Values accepted by one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSet {
    /// `*`
    Any,
    /// Bit `n` set means value `n` matches.
    Values(u64),
}

impl FieldSet {
    pub fn contains(self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Values(bits) => value < 64 && bits & (1u64 << value) != 0,
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

/// Parse a five-field cron expression.
pub fn parse_cron(expr: &str) -> Result<CronExpr, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::FieldCount(fields.len()));
    }

    let mut day_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
    // 7 is Sunday too
    if let FieldSet::Values(bits) = day_of_week {
        if bits & (1 << 7) != 0 {
            day_of_week = FieldSet::Values((bits & !(1 << 7)) | 1);
        }
    }

    Ok(CronExpr {
        source: fields.join(" "),
        minute: parse_field(fields[0], MINUTE)?,
        hour: parse_field(fields[1], HOUR)?,
        day_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
        month: parse_field(fields[3], MONTH)?,
        day_of_week,
    })
}

fn parse_field(raw: &str, bounds: FieldRange) -> Result<FieldSet, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: bounds.name,
        value: raw.to_string(),
        reason,
    };

    if raw == "*" {
        return Ok(FieldSet::Any);
    }

    let number = |s: &str| -> Result<u32, CronError> {
        let n: u32 = s
            .parse()
            .map_err(|_| invalid(format!("'{s}' is not a number")))?;
        if n < bounds.min || n > bounds.max {
            return Err(invalid(format!(
                "{n} is outside {}-{}",
                bounds.min, bounds.max
            )));
        }
        Ok(n)
    };

    let mut bits = 0u64;
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list item".into()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("step '{step}' is not a number")))?;
                if step == 0 {
                    return Err(invalid("step must be positive".into()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (bounds.min, bounds.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let (lo, hi) = (number(lo)?, number(hi)?);
            if lo > hi {
                return Err(invalid(format!("range {lo}-{hi} is reversed")));
            }
            (lo, hi)
        } else {
            let n = number(range)?;
            // `N/S` runs from N to the end of the field
            (n, if step.is_some() { bounds.max } else { n })
        };

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            bits |= 1u64 << value;
        }
    }

    Ok(FieldSet::Values(bits))
}

impl CronExpr {
    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.month.contains(date.month())
            && self.day_of_month.contains(date.day())
            && self.day_of_week.contains(date.weekday().num_days_from_sunday())
    }

    /// Whether a local wall-clock time matches (seconds are ignored).
    pub fn matches<T: Datelike + Timelike>(&self, t: &T) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month())
            && self.day_of_month.contains(t.day())
            && self.day_of_week.contains(t.weekday().num_days_from_sunday())
    }

    /// Whether `now` matches when viewed in `tz`.
    pub fn matches_in(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.matches(&now.with_timezone(&tz))
    }

    /// The first matching minute strictly after `after`, evaluated in `tz`.
    ///
    /// Returns `None` for expressions that can never match (e.g. `0 0 30 2 *`).
    /// Local times skipped by a DST change are never returned.
    pub fn next_fire(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t: NaiveDateTime =
            local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = t + Duration::days(SEARCH_DAYS);

        while t < limit {
            if !self.date_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if self.minute.contains(t.minute()) {
                if let Some(dt) = tz.from_local_datetime(&t).earliest() {
                    let utc = dt.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
            }
            t += Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cron(s)
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

/// Per-minute identity of a scheduled fire: `name:YYYY-MM-DD-HH:mm`.
pub fn dedup_key<T: TimeZone>(name: &str, local: &DateTime<T>) -> String
where
    T::Offset: fmt::Display,
{
    format!("{name}:{}", local.format("%Y-%m-%d-%H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn test_field_count() {
        assert_eq!(parse_cron("* * * *"), Err(CronError::FieldCount(4)));
        assert_eq!(parse_cron("0 * * * * *"), Err(CronError::FieldCount(6)));
        assert!(parse_cron("  0   9 *  * 1-5 ").is_ok());
    }

    #[test]
    fn test_minute_and_hour_boundaries() {
        let first = parse_cron("0 0 * * *").unwrap();
        assert!(first.matches(&at(2026, 3, 1, 0, 0)));
        assert!(!first.matches(&at(2026, 3, 1, 0, 1)));

        let last = parse_cron("59 23 * * *").unwrap();
        assert!(last.matches(&at(2026, 3, 1, 23, 59)));
        assert!(!last.matches(&at(2026, 3, 1, 22, 59)));

        assert!(parse_cron("60 * * * *").is_err());
        assert!(parse_cron("* 24 * * *").is_err());
        assert!(parse_cron("* * 0 * *").is_err());
        assert!(parse_cron("* * 32 * *").is_err());
        assert!(parse_cron("* * * 13 *").is_err());
        assert!(parse_cron("* * * * 8").is_err());
    }

    #[test]
    fn test_lists_ranges_and_steps() {
        let expr = parse_cron("*/15 9-17/4 1,15 * *").unwrap();
        for minute in [0, 15, 30, 45] {
            assert!(expr.matches(&at(2026, 3, 1, 9, minute)), "minute {minute}");
        }
        assert!(!expr.matches(&at(2026, 3, 1, 9, 10)));
        assert!(expr.matches(&at(2026, 3, 15, 13, 0)));
        assert!(expr.matches(&at(2026, 3, 15, 17, 0)));
        assert!(!expr.matches(&at(2026, 3, 15, 11, 0)));
        assert!(!expr.matches(&at(2026, 3, 2, 9, 0)));

        let offset = parse_cron("5/20 * * * *").unwrap();
        assert!(offset.matches(&at(2026, 3, 1, 0, 5)));
        assert!(offset.matches(&at(2026, 3, 1, 0, 45)));
        assert!(!offset.matches(&at(2026, 3, 1, 0, 0)));
    }

    #[test]
    fn test_invalid_syntax() {
        for bad in ["*/0 * * * *", "5-1 * * * *", "a * * * *", "1,,2 * * * *", "*/x * * * *"] {
            assert!(parse_cron(bad).is_err(), "{bad} should be rejected");
        }
        let err = parse_cron("61 * * * *").unwrap_err();
        assert!(err.to_string().contains("minute"));
    }

    #[test]
    fn test_sunday_is_zero_or_seven() {
        // 2026-03-01 is a Sunday
        let sunday = at(2026, 3, 1, 12, 0);
        assert!(parse_cron("0 12 * * 0").unwrap().matches(&sunday));
        assert!(parse_cron("0 12 * * 7").unwrap().matches(&sunday));
        assert!(parse_cron("0 12 * * 5-7").unwrap().matches(&sunday));
        assert!(!parse_cron("0 12 * * 1-5").unwrap().matches(&sunday));
    }

    #[test]
    fn test_day_fields_are_anded() {
        // 2026-03-02 is a Monday, 2026-03-09 is the following Monday
        let expr = parse_cron("0 0 2 * 1").unwrap();
        assert!(expr.matches(&at(2026, 3, 2, 0, 0)));
        assert!(!expr.matches(&at(2026, 3, 9, 0, 0)));
    }

    #[test]
    fn test_matches_in_timezone() {
        let expr = parse_cron("0 9 * * *").unwrap();
        let tz = parse_timezone("America/Los_Angeles").unwrap();
        // 17:00 UTC == 09:00 PST
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 17, 0, 30).unwrap();
        assert!(expr.matches_in(now, tz));
        assert!(!expr.matches_in(now, chrono_tz::UTC));
    }

    #[test]
    fn test_next_fire() {
        let expr = parse_cron("30 9 * * 1-5").unwrap();
        // Saturday 2026-03-07 10:00 UTC -> Monday 09:30
        let after = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap();
        let next = expr.next_fire(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 9, 9, 30, 0).unwrap());

        // Strictly after
        let exact = Utc.with_ymd_and_hms(2026, 3, 9, 9, 30, 0).unwrap();
        let next = expr.next_fire(exact, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap());
    }

    #[test]
    fn test_next_fire_in_timezone_and_impossible() {
        let expr = parse_cron("0 9 * * *").unwrap();
        let tz = parse_timezone("Asia/Tokyo").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        // 09:00 JST == 00:00 UTC, so the next one is the following day
        assert_eq!(
            expr.next_fire(after, tz),
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap())
        );

        let never = parse_cron("0 0 30 2 *").unwrap();
        assert_eq!(never.next_fire(after, chrono_tz::UTC), None);
    }

    #[test]
    fn test_dedup_key() {
        let tz = parse_timezone("Europe/Berlin").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 4, 6, 5, 59).unwrap();
        assert_eq!(dedup_key("researcher", &now.with_timezone(&tz)), "researcher:2026-07-04-08:05");
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_none());
    }
}
