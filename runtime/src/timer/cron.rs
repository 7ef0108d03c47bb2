use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid expression {0:?}: expected 5 or 6 fields")]
    FieldCount(String),

    #[error("invalid {field} field {value:?}: {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59 };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 6 };

/// Cron schedule.
///
/// Fields, space separated: `[second] minute hour day-of-month month
/// day-of-week`. With five fields the second is 0. Each field takes `*`,
/// `a`, `a-b`, `*/n`, `a/n`, `a-b/n` and comma-separated lists of those.
/// Day-of-week counts from Sunday = 0.
///
/// When both day fields are restricted, a day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    sec: u64,
    min: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => (1u64, &fields[..]),
            6 => (parse_field(fields[0], &SECOND)?, &fields[1..]),
            _ => return Err(CronError::FieldCount(expr.to_string())),
        };

        Ok(Self {
            source: expr.trim().to_string(),
            sec,
            min: parse_field(rest[0], &MINUTE)?,
            hour: parse_field(rest[1], &HOUR)?,
            dom: parse_field(rest[2], &DAY_OF_MONTH)?,
            month: parse_field(rest[3], &MONTH)?,
            dow: parse_field(rest[4], &DAY_OF_WEEK)?,
        })
    }

    /// First matching instant strictly after `after`, searching up to the end
    /// of the following year. Local times that do not exist in `after`'s
    /// zone are skipped.
    pub fn next<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let limit = after.naive_local().year() + 1;

        let mut from = after.naive_local();
        loop {
            let candidate = self.next_naive(from, limit)?;
            if let Some(at) = tz.from_local_datetime(&candidate).earliest() {
                return Some(at);
            }
            from = candidate;
        }
    }

    fn next_naive(&self, after: NaiveDateTime, limit: i32) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + ChronoDuration::seconds(1);

        loop {
            if t.year() > limit {
                return None;
            }
            if !has(self.month, t.month()) {
                t = first_of_next_month(t.date())?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hour, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + ChronoDuration::hours(1);
                continue;
            }
            if !has(self.min, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + ChronoDuration::minutes(1);
                continue;
            }
            if !has(self.sec, t.second()) {
                t += ChronoDuration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.dom, date.day());
        let dow = has(self.dow, date.weekday().num_days_from_sunday());

        if self.dom == full_mask(&DAY_OF_MONTH) {
            dow
        } else if self.dow == full_mask(&DAY_OF_WEEK) {
            dom
        } else {
            dom || dow
        }
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn full_mask(spec: &FieldSpec) -> u64 {
    (spec.min..=spec.max).fold(0, |mask, v| mask | (1u64 << v))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let invalid = |reason: &str| CronError::Field {
        field: spec.name,
        value: field.to_string(),
        reason: reason.to_string(),
    };
    let number = |s: &str| s.parse::<u32>().map_err(|_| invalid("not a number"));

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(number(step)?)),
            None => (part, None),
        };
        if step == Some(0) {
            return Err(invalid("step must be positive"));
        }

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (number(a)?, number(b)?)
        } else {
            let start = number(range)?;
            // `a/n` runs from `a` to the end of the range.
            (start, if step.is_some() { spec.max } else { start })
        };

        if start < spec.min || end > spec.max {
            return Err(invalid("out of range"));
        }
        if start > end {
            return Err(invalid("range start after end"));
        }

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}
