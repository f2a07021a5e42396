//! Recurrence rules: fixed intervals and 5-field cron expressions.
//!
//! Cron format: "MIN HOUR DOM MON DOW", evaluated in UTC.
//! Each field accepts `*`, `N`, `a-b`, `*/n`, `a-b/n`, `N/n` and comma lists.
//! DOW is 0-7 where both 0 and 7 mean Sunday. When DOM and DOW are both
//! restricted a day matches if either does (classic cron semantics).
//! Example: "0 8 * * 1-5" = weekdays at 08:00.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::types::Recurrence;

/// How far ahead `next_after` searches before giving up (covers Feb 29 rules).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// Longest accepted interval (a century).
const MAX_INTERVAL_SECS: u64 = 100 * 366 * 86_400;

/// Parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(HangoutsError::InvalidSchedule(format!(
                "cron expression '{expression}' needs 5 fields: MIN HOUR DOM MON DOW"
            )));
        }

        let minutes = parse_field(parts[0], 0, 59)?;
        let hours = parse_field(parts[1], 0, 23)?;
        let days_of_month = parse_field(parts[2], 1, 31)?;
        let months = parse_field(parts[3], 1, 12)?;
        let mut days_of_week = parse_field(parts[4], 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = midnight(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, t.day());
        let dow = bit(self.days_of_week, t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    midnight(NaiveDate::from_ymd_opt(year, month, 1)?)
}

/// Parse one cron field into a bitmask of allowed values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<u64> {
    let invalid = |why: &str| {
        HangoutsError::InvalidSchedule(format!("cron field '{field}': {why}"))
    };

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid("bad range start"))?;
            let b: u32 = b.parse().map_err(|_| invalid("bad range end"))?;
            (a, b)
        } else {
            let n: u32 = range.parse().map_err(|_| invalid("not a number"))?;
            // "N/step" runs from N to the field maximum.
            if step.is_some() { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(&format!("out of range {min}-{max}")));
        }
        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

/// Reject malformed rules: zero intervals, unparsable cron, cron that never fires.
pub fn validate(rule: &Recurrence, now: DateTime<Utc>) -> Result<()> {
    match rule {
        Recurrence::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(HangoutsError::InvalidSchedule(
                    "interval must be at least one second".into(),
                ));
            }
            if *every_secs > MAX_INTERVAL_SECS {
                return Err(HangoutsError::InvalidSchedule("interval is too large".into()));
            }
            Ok(())
        }
        Recurrence::Cron { expression } => {
            let schedule = CronSchedule::parse(expression)?;
            if schedule.next_after(now).is_none() {
                return Err(HangoutsError::InvalidSchedule(format!(
                    "cron expression '{expression}' never fires"
                )));
            }
            Ok(())
        }
    }
}

/// Next occurrence strictly after `previous`.
pub fn next_occurrence(rule: &Recurrence, previous: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match rule {
        Recurrence::Interval { every_secs } => {
            let secs = i64::try_from(*every_secs).ok()?;
            previous.checked_add_signed(Duration::try_seconds(secs)?)
        }
        Recurrence::Cron { expression } => {
            CronSchedule::parse(expression).ok()?.next_after(previous)
        }
    }
}

/// First occurrence at or after both `anchor` and `now`.
/// Intervals keep their phase relative to `anchor`; cron rules roll forward
/// to the first matching minute.
pub fn first_occurrence_from(
    rule: &Recurrence,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match rule {
        Recurrence::Interval { .. } if anchor >= now => Some(anchor),
        Recurrence::Interval { every_secs } => {
            let every = i64::try_from(*every_secs).ok()?.max(1);
            let behind = (now - anchor).num_seconds();
            let steps = behind / every + i64::from(behind % every != 0);
            let candidate =
                anchor.checked_add_signed(Duration::try_seconds(steps.checked_mul(every)?)?)?;
            // Sub-second remainders can leave the candidate just short of `now`.
            if candidate < now {
                candidate.checked_add_signed(Duration::try_seconds(every)?)
            } else {
                Some(candidate)
            }
        }
        Recurrence::Cron { expression } => {
            let from = anchor.max(now);
            CronSchedule::parse(expression).ok()?.next_after(from - Duration::seconds(1))
        }
    }
}
