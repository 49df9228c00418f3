use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{JobplaneError, Result};

/// How often an execution request fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fire once at the start time.
    #[default]
    Once,
    /// Fire every `every_secs`, aligned to the start time.
    Interval { every_secs: u64 },
    /// Five-field cron expression evaluated in the request's time zone.
    Cron { expression: String },
}

impl Recurrence {
    pub fn hourly() -> Self {
        Recurrence::Interval { every_secs: 3600 }
    }

    pub fn daily() -> Self {
        Recurrence::Interval {
            every_secs: 86_400,
        }
    }

    pub fn weekly() -> Self {
        Recurrence::Interval {
            every_secs: 7 * 86_400,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Recurrence::Cron {
            expression: expression.into(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Recurrence::Once)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Recurrence::Once => Ok(()),
            Recurrence::Interval { every_secs } => interval_step(*every_secs).map(|_| ()),
            Recurrence::Cron { expression } => CronSchedule::parse(expression).map(|_| ()),
        }
    }

    /// Due time recorded when the request is created.
    ///
    /// A past start is treated differently per recurrence. An interval is
    /// anchored to its start, so it collapses to the latest boundary at or
    /// before `now` and fires on the next Beat tick. A cron expression has
    /// no anchor; it waits for its first boundary at or after `now`. Either
    /// way missed boundaries never fire in a burst.
    pub fn initial_due(
        &self,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Recurrence::Once => Ok(Some(start)),
            Recurrence::Interval { every_secs } => {
                if start >= now {
                    return Ok(Some(start));
                }
                let every = interval_step(*every_secs)?;
                let elapsed = (now - start).num_seconds();
                advance(start, elapsed / every, every).map(Some)
            }
            Recurrence::Cron { expression } => {
                let schedule = CronSchedule::parse(expression)?;
                let from = if start > now { start } else { now };
                Ok(schedule.next_after(from - Duration::seconds(1), tz))
            }
        }
    }

    /// Next due time strictly after `now`, given that boundary `due` was
    /// just claimed. `None` means the request is finished.
    pub fn next_after(
        &self,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Recurrence::Once => Ok(None),
            Recurrence::Interval { every_secs } => {
                let every = interval_step(*every_secs)?;
                let elapsed = (now - due).num_seconds().max(0);
                advance(due, elapsed / every + 1, every).map(Some)
            }
            Recurrence::Cron { expression } => {
                let schedule = CronSchedule::parse(expression)?;
                let from = if now > due { now } else { due };
                Ok(schedule.next_after(from, tz))
            }
        }
    }
}

/// Longest accepted interval: one leap year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 86_400;

fn interval_step(every_secs: u64) -> Result<i64> {
    if every_secs == 0 {
        return Err(JobplaneError::validation(
            "schedule",
            "interval must be at least one second",
        ));
    }
    if every_secs > MAX_INTERVAL_SECS {
        return Err(JobplaneError::validation(
            "schedule",
            format!("interval must not exceed {} seconds", MAX_INTERVAL_SECS),
        ));
    }
    Ok(every_secs as i64)
}

/// `from + steps * every` seconds, or a validation error when the result
/// leaves the representable date range.
fn advance(from: DateTime<Utc>, steps: i64, every: i64) -> Result<DateTime<Utc>> {
    steps
        .checked_mul(every)
        .and_then(Duration::try_seconds)
        .and_then(|offset| from.checked_add_signed(offset))
        .ok_or_else(|| JobplaneError::validation("schedule", "next due time is out of range"))
}

pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| JobplaneError::validation("time_zone", format!("{}", e)))
}

/// Parsed `minute hour day-of-month month day-of-week` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    dom_restricted: bool,
    dow_restricted: bool,
}

/// How far ahead to look for a match before giving up (e.g. `0 0 31 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expanded = match expression.trim() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(cron_error(expression, "expected 5 fields"));
        }

        let minutes = parse_field(fields[0], 0, 59, expression)?;
        let hours = parse_field(fields[1], 0, 23, expression)?;
        let days_of_month = parse_field(fields[2], 1, 31, expression)?;
        let months = parse_field(fields[3], 1, 12, expression)?;
        let mut days_of_week = parse_field(fields[4], 0, 7, expression)?;
        // 7 is an alias for Sunday
        if days_of_week[7] {
            days_of_week[0] = true;
        }
        days_of_week.truncate(7);

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, t: &NaiveDateTime) -> bool {
        let dom = self.days_of_month[t.day() as usize];
        let dow = self.days_of_week[t.weekday().num_days_from_sunday() as usize];
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = t + Duration::days(SEARCH_HORIZON_DAYS);

        while t < horizon {
            if !self.months[t.month() as usize] {
                t = first_of_next_month(&t)?;
                continue;
            }
            if !self.day_matches(&t) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours[t.hour() as usize] {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes[t.minute() as usize] {
                t += Duration::minutes(1);
                continue;
            }
            match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    let utc = dt.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
                // Skipped by a DST jump.
                LocalResult::None => {}
            }
            t += Duration::minutes(1);
        }
        None
    }
}

fn first_of_next_month(t: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn cron_error(expression: &str, reason: &str) -> JobplaneError {
    JobplaneError::validation(
        "schedule",
        format!("invalid cron expression {:?}: {}", expression, reason),
    )
}

/// Expand one field into a lookup table indexed by value.
fn parse_field(field: &str, min: u32, max: u32, expression: &str) -> Result<Vec<bool>> {
    let mut table = vec![false; max as usize + 1];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| cron_error(expression, "bad step"))?;
                if step == 0 {
                    return Err(cron_error(expression, "step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| cron_error(expression, "bad range"))?;
            let hi: u32 = hi.parse().map_err(|_| cron_error(expression, "bad range"))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| cron_error(expression, "bad value"))?;
            // `5/15` means "from 5 to the end, every 15"
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(cron_error(
                expression,
                &format!("value out of range {}-{}", min, max),
            ));
        }
        let mut v = lo;
        while v <= hi {
            table[v as usize] = true;
            v += step;
        }
    }
    Ok(table)
}
