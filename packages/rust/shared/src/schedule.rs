//! Cron-style crawl schedules.
//!
//! Source schedules are parsed once, at registration, into a [`CronSchedule`]
//! whose only job is answering "when is the next tick after `t`?".

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{GleanerError, Result};

/// A parsed cron expression.
///
/// Accepts classic five-field expressions (`min hour dom mon dow`), the
/// six/seven-field form with seconds (and year), and `@hourly`-style macros.
/// In five-field expressions day-of-week numbers are the usual Unix ones
/// (0 or 7 = Sunday, 1 = Monday). Six/seven-field expressions are passed to
/// the `cron` crate as written, where 1 = Sunday.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression, rejecting anything the scheduler could not fire.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(GleanerError::config("empty schedule expression"));
        }

        let normalized = if trimmed.starts_with('@') {
            trimmed.to_string()
        } else {
            match trimmed.split_whitespace().count() {
                5 => five_field(trimmed)?,
                6 | 7 => trimmed.to_string(),
                n => {
                    return Err(GleanerError::config(format!(
                        "schedule '{trimmed}' has {n} fields, expected 5, 6 or 7"
                    )));
                }
            }
        };

        let inner = cron::Schedule::from_str(&normalized).map_err(|e| {
            GleanerError::config(format!("invalid schedule '{trimmed}': {e}"))
        })?;

        Ok(Self {
            expr: trimmed.to_string(),
            inner,
        })
    }

    /// The expression as written by the operator.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First tick strictly after `after`, or `None` if the schedule never fires again.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(after).next()
    }
}

const DAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Prepend a seconds field and rewrite numeric weekdays as names.
fn five_field(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let dow = unix_weekdays(fields[4])
        .map_err(|reason| GleanerError::config(format!("invalid schedule '{expr}': {reason}")))?;
    Ok(format!(
        "0 {} {} {} {} {dow}",
        fields[0], fields[1], fields[2], fields[3]
    ))
}

/// `1-5` → `MON,TUE,WED,THU,FRI`. Items already spelled with names, and a bare
/// `*` or `?`, are kept as written.
fn unix_weekdays(field: &str) -> std::result::Result<String, String> {
    let mut days: Vec<&str> = Vec::new();
    for item in field.split(',') {
        if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
            if !days.contains(&item) {
                days.push(item);
            }
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step '{item}'"))?;
                if step == 0 {
                    return Err(format!("zero day-of-week step '{item}'"));
                }
                (base, Some(step))
            }
            None => (item, None),
        };
        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((a, b)) => (weekday(a)?, weekday(b)?),
            None => {
                let day = weekday(base)?;
                (day, if step.is_some() { 7 } else { day })
            }
        };
        if start > end {
            return Err(format!("descending day-of-week range '{item}'"));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            let name = DAY_NAMES[day];
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }
    Ok(days.join(","))
}

fn weekday(value: &str) -> std::result::Result<usize, String> {
    match value.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day of week '{value}' is not in 0-7")),
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_every_four_hours() {
        let schedule = CronSchedule::parse("0 */4 * * *").expect("parse");
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let next = schedule.next_after(&t).expect("next tick");
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn next_after_is_strict() {
        let schedule = CronSchedule::parse("0 */4 * * *").unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let next = schedule.next_after(&tick).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn six_field_and_macro_accepted() {
        assert!(CronSchedule::parse("30 0 6 * * *").is_ok());
        assert!(CronSchedule::parse("@hourly").is_ok());
    }

    #[test]
    fn numeric_weekdays_are_unix_numbers() {
        // Saturday.
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let monday = CronSchedule::parse("0 9 * * 1").unwrap();
        assert_eq!(
            monday.next_after(&t).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
        );

        for sunday in ["0 0 * * 0", "0 0 * * 7"] {
            let schedule = CronSchedule::parse(sunday).unwrap();
            assert_eq!(
                schedule.next_after(&t).unwrap(),
                Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()
            );
        }
    }

    #[test]
    fn weekday_ranges_lists_and_names() {
        assert_eq!(unix_weekdays("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(unix_weekdays("5-7").unwrap(), "FRI,SAT,SUN");
        assert_eq!(unix_weekdays("0,6").unwrap(), "SUN,SAT");
        assert_eq!(unix_weekdays("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(unix_weekdays("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(unix_weekdays("*").unwrap(), "*");
        assert!(unix_weekdays("8").is_err());
        assert!(unix_weekdays("5-1").is_err());

        // Friday 2024-05-31 → the next weekday tick is Monday.
        let weekdays = CronSchedule::parse("30 8 * * 1-5").unwrap();
        let friday_evening = Utc.with_ymd_and_hms(2024, 5, 31, 18, 0, 0).unwrap();
        assert_eq!(
            weekdays.next_after(&friday_evening).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 3, 8, 30, 0).unwrap()
        );
        assert_eq!(weekdays.expr(), "30 8 * * 1-5");
    }

    #[test]
    fn invalid_expressions_rejected() {
        let err = CronSchedule::parse("every four hours").unwrap_err();
        assert!(err.to_string().contains("config error"));
        assert!(CronSchedule::parse("").is_err());
        assert!(CronSchedule::parse("99 * * * *").is_err());
        assert!(CronSchedule::parse("* *").is_err());
        assert!(CronSchedule::parse("0 0 * * 9").is_err());
    }
}
