//! Compiled job schedules.
//!
//! Cron expressions are evaluated by the `cron` crate, which wants a leading
//! seconds field and numbers Sunday as 1. Standard 5-field expressions are
//! normalized before parsing: a `0` seconds field is prepended and numeric
//! day-of-week values (`0`-`7`, both ends meaning Sunday) are rewritten as
//! day names.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches, as in Vixie cron. The `cron` crate requires both,
//! so such expressions compile into two schedules, one per day field, and
//! the earlier occurrence wins. A field starting with `*` counts as
//! unrestricted.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ScheduleError;
use crate::job::ScheduleSpec;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Upper bound on occurrences walked while coalescing missed windows.
const MAX_CATCH_UP_SCAN: u64 = 10_000;

/// A parsed, ready-to-evaluate schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron {
        /// Expression as written by the user.
        expression: String,
        /// One schedule, or two when both day fields are restricted.
        compiled: Vec<cron::Schedule>,
    },
    Interval(Duration),
}

/// Result of coalescing the occurrences that elapsed while nothing fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    /// The single occurrence that gets dispatched: the latest one `<= now`.
    pub fire_for: DateTime<Utc>,

    /// Earlier occurrences that are skipped.
    pub missed: u64,

    /// Smallest occurrence strictly after `now`.
    pub next: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Parse a 5- or 6-field cron expression, or an `@` macro.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let compiled = normalize(expression)?
            .iter()
            .map(|normalized| {
                cron::Schedule::from_str(normalized).map_err(|e| {
                    ScheduleError::InvalidExpression {
                        expression: expression.to_string(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Schedule::Cron {
            expression: expression.trim().to_string(),
            compiled,
        })
    }

    pub fn interval(every: Duration) -> Result<Self, ScheduleError> {
        if every.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Schedule::Interval(every))
    }

    pub fn from_spec(spec: &ScheduleSpec) -> Result<Self, ScheduleError> {
        match spec {
            ScheduleSpec::Expression(expr) => Self::parse(expr),
            ScheduleSpec::Interval(every) => Self::interval(*every),
        }
    }

    /// Smallest instant strictly greater than `after` that satisfies the schedule.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { compiled, .. } => compiled
                .iter()
                .filter_map(|schedule| schedule.after(&after).next())
                .min(),
            Schedule::Interval(every) => {
                let step = chrono::Duration::from_std(*every).ok()?;
                after.checked_add_signed(step)
            }
        }
    }

    /// Collapse every occurrence in `[due, now]` into a single run.
    ///
    /// `due` is the occurrence the job was armed for and must not be later
    /// than `now`.
    pub fn catch_up(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> CatchUp {
        if now <= due {
            return CatchUp {
                fire_for: due,
                missed: 0,
                next: self.next_after(due),
            };
        }

        match self {
            Schedule::Interval(every) => {
                let step_ms = every.as_millis().max(1) as i64;
                let elapsed_ms = (now - due).num_milliseconds();
                let periods = elapsed_ms / step_ms;
                let fire_for = due + chrono::Duration::milliseconds(periods * step_ms);
                CatchUp {
                    fire_for,
                    missed: periods as u64,
                    next: self.next_after(fire_for),
                }
            }
            Schedule::Cron { .. } => {
                let mut latest = due;
                let mut missed = 0u64;
                while missed < MAX_CATCH_UP_SCAN {
                    match self.next_after(latest) {
                        Some(next) if next <= now => {
                            latest = next;
                            missed += 1;
                        }
                        _ => break,
                    }
                }
                if missed == MAX_CATCH_UP_SCAN {
                    latest = self.latest_at_or_before(latest, now);
                }
                CatchUp {
                    fire_for: latest,
                    missed,
                    next: self.next_after(now),
                }
            }
        }
    }

    /// Latest occurrence in `[from, now]`, given `from` is an occurrence.
    fn latest_at_or_before(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut lo = from;
        let mut hi = now;
        while hi - lo > chrono::Duration::seconds(1) {
            let mid = lo + (hi - lo) / 2;
            match self.next_after(mid) {
                Some(next) if next <= now => lo = next,
                _ => hi = mid,
            }
        }
        while let Some(next) = self.next_after(lo) {
            if next > now {
                break;
            }
            lo = next;
        }
        lo
    }

    pub fn describe(&self) -> String {
        match self {
            Schedule::Cron { expression, .. } => expression.clone(),
            Schedule::Interval(every) => format!("every {}s", every.as_secs_f64()),
        }
    }
}

/// Rewrite a user expression into the form(s) the `cron` crate parses.
fn normalize(expression: &str) -> Result<Vec<String>, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(vec![trimmed.to_string()]);
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(ScheduleError::FieldCount(n)),
    }

    fields[5] = normalize_day_of_week(&fields[5]).map_err(|reason| {
        ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        }
    })?;

    if is_restricted(&fields[3]) && is_restricted(&fields[5]) {
        let mut by_month_day = fields.clone();
        by_month_day[5] = "*".to_string();
        let mut by_weekday = fields;
        by_weekday[3] = "*".to_string();
        return Ok(vec![by_month_day.join(" "), by_weekday.join(" ")]);
    }
    Ok(vec![fields.join(" ")])
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Turn numeric day-of-week items into day names. Named items and `*` pass
/// through untouched.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let numeric = !base.is_empty() && base.chars().all(|c| c.is_ascii_digit() || c == '-');
        if !numeric {
            items.push(item.to_string());
            continue;
        }

        let (start, end) = match base.split_once('-') {
            Some((a, b)) => (parse_day(a)?, parse_day(b)?),
            None => {
                let day = parse_day(base)?;
                (day, if step.is_some() { 7 } else { day })
            }
        };
        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", base));
        }

        let mut days: Vec<usize> = (start..=end)
            .step_by(step.unwrap_or(1))
            .map(|d| d % 7)
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.into_iter().map(|d| DAY_NAMES[d].to_string()));
    }
    Ok(items.join(","))
}

fn parse_day(value: &str) -> Result<usize, String> {
    let day: usize = value
        .parse()
        .map_err(|_| format!("invalid day-of-week '{}'", value))?;
    if day > 7 {
        return Err(format!("day-of-week {} out of range 0-7", day));
    }
    Ok(day)
}

#[cfg(test)]
#[path = "schedule_tests.rs"]
mod tests;
