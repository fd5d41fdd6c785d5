//! Five-field cron expressions: parsing, validation, timezone-aware next run.
//!
//! Supported syntax per field: `*`, values, names (JAN..DEC, SUN..SAT),
//! ranges (`a-b`), lists (`a,b,c`), and steps (`*/n`, `a-b/n`). The aliases
//! `@hourly`, `@daily`, `@weekly`, `@monthly`, and `@yearly` expand to their
//! conventional expressions. Day-of-month and day-of-week follow classic cron
//! semantics: when both are restricted, a day matching either fires.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Field order: minute, hour, day-of-month, month, day-of-week.
const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far `next_after` scans before giving up (covers leap-day schedules).
const MAX_SCAN_DAYS: i64 = 4 * 366;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field: {value}")]
    Field { field: &'static str, value: String },
    #[error("unknown alias: {0}")]
    UnknownAlias(String),
}

/// A parsed cron expression. Construct with [`CronExpr::parse`].
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: [bool; 60],
    hours: [bool; 24],
    days: [bool; 32],
    months: [bool; 13],
    weekdays: [bool; 7],
    day_unrestricted: bool,
    weekday_unrestricted: bool,
    source: String,
}

impl CronExpr {
    /// Parses and validates an expression. Errors name the offending field.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();
        let expanded = match expr {
            a if a.starts_with('@') => match a.to_ascii_lowercase().as_str() {
                "@hourly" => "0 * * * *".to_string(),
                "@daily" | "@midnight" => "0 0 * * *".to_string(),
                "@weekly" => "0 0 * * 0".to_string(),
                "@monthly" => "0 0 1 * *".to_string(),
                "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
                other => return Err(CronError::UnknownAlias(other.to_string())),
            },
            other => other.to_string(),
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let minutes = parse_field::<60>(fields[0], 0, 59, &[], FIELD_NAMES[0])?;
        let hours = parse_field::<24>(fields[1], 0, 23, &[], FIELD_NAMES[1])?;
        let days = parse_field::<32>(fields[2], 1, 31, &[], FIELD_NAMES[2])?;
        let months = parse_field::<13>(fields[3], 1, 12, &MONTH_NAMES, FIELD_NAMES[3])?;
        let weekdays = parse_dow(fields[4])?;

        Ok(Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
            day_unrestricted: fields[2] == "*",
            weekday_unrestricted: fields[4] == "*",
            source: expr.to_string(),
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next fire time strictly after `after`, computed in `tz` and returned in UTC.
    ///
    /// Ambiguous local times (DST fall-back) resolve to the earlier instant;
    /// nonexistent local times (spring-forward gap) are skipped. Returns `None`
    /// only when no day within the scan horizon matches (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        let start = local
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local)
            + ChronoDuration::minutes(1);
        let start_date = start.date_naive();
        let start_minute_of_day = start.hour() * 60 + start.minute();

        for offset in 0..MAX_SCAN_DAYS {
            let date = start_date + ChronoDuration::days(offset);
            if !self.day_matches(date) {
                continue;
            }
            let floor = if offset == 0 { start_minute_of_day } else { 0 };
            if let Some(utc) = self.first_time_on(date, floor, tz) {
                return Some(utc);
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months[date.month() as usize] {
            return false;
        }
        let dom_ok = self.days[date.day() as usize];
        let dow_ok = self.weekdays[date.weekday().num_days_from_sunday() as usize];
        match (self.day_unrestricted, self.weekday_unrestricted) {
            (true, true) => true,
            (false, false) => dom_ok || dow_ok,
            (false, true) => dom_ok,
            (true, false) => dow_ok,
        }
    }

    /// First matching wall-clock time on `date` at or after `floor` minutes
    /// past midnight, resolved in `tz`. Skips DST gaps.
    fn first_time_on(&self, date: NaiveDate, floor: u32, tz: Tz) -> Option<DateTime<Utc>> {
        for hour in 0..24u32 {
            if !self.hours[hour as usize] {
                continue;
            }
            for minute in 0..60u32 {
                if !self.minutes[minute as usize] {
                    continue;
                }
                if hour * 60 + minute < floor {
                    continue;
                }
                let naive = date.and_hms_opt(hour, minute, 0)?;
                match tz.from_local_datetime(&naive) {
                    LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
                    LocalResult::Ambiguous(earlier, _) => return Some(earlier.with_timezone(&Utc)),
                    LocalResult::None => continue,
                }
            }
        }
        None
    }
}

fn parse_field<const N: usize>(
    spec: &str,
    min: u32,
    max: u32,
    names: &[&str],
    field: &'static str,
) -> Result<[bool; N], CronError> {
    let mut set = [false; N];
    let err = || CronError::Field {
        field,
        value: spec.to_string(),
    };
    for part in spec.split(',') {
        if part.is_empty() {
            return Err(err());
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| err())?;
                if step == 0 {
                    return Err(err());
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, min, max, names).ok_or_else(err)?,
                parse_value(b, min, max, names).ok_or_else(err)?,
            )
        } else {
            let v = parse_value(range, min, max, names).ok_or_else(err)?;
            // A bare value with a step means "from v to max" (vixie cron).
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(err());
        }
        let mut v = lo;
        while v <= hi {
            set[v as usize] = true;
            v += step;
        }
    }
    Ok(set)
}

fn parse_value(text: &str, min: u32, max: u32, names: &[&str]) -> Option<u32> {
    if let Ok(n) = text.parse::<u32>() {
        return (min..=max).contains(&n).then_some(n);
    }
    let lower = text.to_ascii_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u32 + min)
}

fn parse_dow(spec: &str) -> Result<[bool; 7], CronError> {
    // Parse with an inclusive 0..=7 domain, then fold 7 (also Sunday) into 0.
    let wide = parse_field::<8>(spec, 0, 7, &DOW_NAMES, FIELD_NAMES[4])?;
    let mut set = [false; 7];
    set.copy_from_slice(&wide[..7]);
    set[0] |= wide[7];
    Ok(set)
}

/// Best-effort IANA timezone of the host: `TZ` env, then `/etc/timezone`.
pub fn detect_system_timezone() -> Option<Tz> {
    if let Ok(tz) = std::env::var("TZ") {
        if let Ok(parsed) = tz.parse::<Tz>() {
            return Some(parsed);
        }
    }
    std::fs::read_to_string("/etc/timezone")
        .ok()
        .and_then(|s| s.trim().parse::<Tz>().ok())
}
