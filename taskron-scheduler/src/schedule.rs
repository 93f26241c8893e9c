//! Five-field cron expressions evaluated in UTC at minute resolution.
//!
//! Fields are minute, hour, day-of-month, month and day-of-week, matched by
//! `croner`. Each field accepts `*`, `?`, literals, ranges, steps and comma
//! lists. Months and weekdays may be written as three-letter names and
//! day-of-week 7 is Sunday. Croner's extensions (`L`, `W`, `#`, `@daily`)
//! are rejected.
//!
//! When both day fields are restricted a day matches if either one does;
//! when at least one is unrestricted (`*`, `?` or `*/1`) both must match.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Months, Timelike, Utc};
use croner::{Cron, errors::CronError};
use taskron_models::errors::TaskronError;

const SEARCH_HORIZON_MONTHS: u32 = 48;

const FIELD_LABELS: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];
const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, TaskronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(TaskronError::invalid_schedule(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut normalized = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            check_field(index, field).map_err(|reason| TaskronError::invalid_schedule(expression, reason))?;
            normalized.push(match *field {
                "?" | "*/1" | "?/1" => "*",
                other => other,
            });
        }

        let cron = Cron::new(&normalized.join(" "))
            .parse()
            .map_err(|err| TaskronError::invalid_schedule(expression, err.to_string()))?;

        Ok(Self {
            expression: fields.join(" "),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        time.second() == 0 && self.cron.is_time_matching(&time).unwrap_or(false)
    }

    /// Earliest matching minute strictly after `after`, no further than
    /// four years out.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, TaskronError> {
        let unmatched = || {
            TaskronError::invalid_schedule(
                &self.expression,
                format!("no matching time within {} years", SEARCH_HORIZON_MONTHS / 12),
            )
        };

        let start = after.with_nanosecond(0).unwrap_or(after);
        let limit = after
            .checked_add_months(Months::new(SEARCH_HORIZON_MONTHS))
            .ok_or_else(unmatched)?;

        match self.cron.find_next_occurrence(&start, false) {
            Ok(next) if next <= limit => Ok(next),
            Ok(_) | Err(CronError::TimeSearchLimitExceeded) => Err(unmatched()),
            Err(err) => Err(TaskronError::invalid_schedule(&self.expression, err.to_string())),
        }
    }
}

impl FromStr for CronSchedule {
    type Err = TaskronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Next fire time of `expression` strictly after `after`.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, TaskronError> {
    CronSchedule::parse(expression)?.next_after(after)
}

/// Validates a schedule and computes the `next_run` a freshly saved task
/// should carry. Disabled tasks are validated too but get no next run.
pub fn initial_next_run(
    expression: &str,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TaskronError> {
    let next = next_fire(expression, now)?;
    Ok(enabled.then_some(next))
}

/// Restricts a field to plain cron syntax. Croner skips empty list entries
/// and understands nth/last/weekday markers, none of which are accepted here.
fn check_field(index: usize, field: &str) -> Result<(), String> {
    let label = FIELD_LABELS[index];
    let names = match index {
        3 => MONTH_NAMES,
        4 => WEEKDAY_NAMES,
        _ => &[],
    };

    for entry in field.split(',') {
        if entry.is_empty() {
            return Err(format!("empty entry in {} field '{}'", label, field));
        }
        if let Some(bad) = entry
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '*' | '?' | '/' | '-')))
        {
            return Err(format!("unexpected '{}' in {} field '{}'", bad, label, field));
        }
        for word in entry
            .split(|ch: char| !ch.is_ascii_alphabetic())
            .filter(|word| !word.is_empty())
        {
            if !names.iter().any(|name| name.eq_ignore_ascii_case(word)) {
                return Err(format!("invalid {} value '{}'", label, word));
            }
        }
    }
    Ok(())
}
