//! Cron evaluation for job schedules.
//!
//! Jobs carry standard 5-field Unix expressions
//! (`minute hour day-of-month month day-of-week`). Parsing and iteration are
//! delegated to the `cron` crate, which expects seconds and year fields and
//! numbers weekdays differently, so each expression is rewritten first.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, validated 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expression: String,
    /// Two entries when both day fields are restricted (either may match).
    schedules: Vec<Schedule>,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            )));
        }
        let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
        let dow = convert_day_of_week(fields[4]).map_err(invalid)?;

        // Vixie cron: a field starting with '*' counts as unrestricted.
        let variants = if !dom.starts_with('*') && !fields[4].starts_with('*') {
            vec![
                format!("0 {minute} {hour} {dom} {month} * *"),
                format!("0 {minute} {hour} * {month} {dow} *"),
            ]
        } else {
            vec![format!("0 {minute} {hour} {dom} {month} {dow} *")]
        };

        let schedules = variants
            .iter()
            .map(|v| Schedule::from_str(v).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            expression: expression.to_string(),
            schedules,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// Smallest trigger instant strictly after `reference`.
    ///
    /// Sub-second precision on `reference` is dropped first; triggers always
    /// land on whole minutes so this never changes the answer.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let reference = reference.with_nanosecond(0).unwrap_or(reference);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&reference).next())
            .min()
    }
}

impl FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        CronExpr::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Computes trigger times for schedule expressions.
///
/// The controller only talks to this trait so tests can substitute a fixed
/// clock-free evaluator.
pub trait ScheduleEvaluator: Send + Sync {
    /// Next trigger strictly after `reference`.
    fn next_after(&self, expression: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Reject expressions that can never be evaluated.
    fn validate(&self, expression: &str) -> Result<()>;
}

/// Default evaluator for 5-field cron expressions, always in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronEvaluator;

impl ScheduleEvaluator for CronEvaluator {
    fn next_after(&self, expression: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        next_after(expression, reference)
    }

    fn validate(&self, expression: &str) -> Result<()> {
        CronExpr::parse(expression).map(|_| ())
    }
}

/// Compute the next UTC trigger time for `expression` strictly after `reference`.
pub fn next_after(expression: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronExpr::parse(expression)?
        .next_after(reference)
        .ok_or_else(|| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: "schedule has no future trigger".to_string(),
        })
}

/// Rewrite a Unix day-of-week field (0 or 7 = Sunday) as weekday names.
///
/// Lists, ranges, steps and names are expanded to an explicit name list so
/// wrap-around ranges like `5-7` need no special casing downstream.
fn convert_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, step)
            }
            None => (item, 1),
        };

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            let (a, b) = (parse_weekday(a)?, parse_weekday(b)?);
            if a > b {
                return Err(format!("day-of-week range '{base}' is reversed"));
            }
            (a, b)
        } else {
            let a = parse_weekday(base)?;
            // `5/2` means "from 5 to the end of the week, every 2"; the week
            // ends at 7 when counting from 7, so `7/2` is Sunday alone.
            if item.contains('/') {
                (a, a.max(6))
            } else {
                (a, a)
            }
        };

        days.extend((start..=end).step_by(step).map(|d| d % 7));
    }

    Ok(days
        .into_iter()
        .map(|d| WEEKDAYS[d])
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_weekday(s: &str) -> std::result::Result<usize, String> {
    if let Ok(n) = s.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {n} out of range 0-7"))
        };
    }
    let upper = s.to_ascii_uppercase();
    WEEKDAYS
        .iter()
        .position(|name| *name == upper)
        .ok_or_else(|| format!("unknown day-of-week '{s}'"))
}
