//! Cron expressions for scheduled instances.
//!
//! Instances declare classic five-field schedules (`minute hour day-of-month
//! month day-of-week`), optionally with a leading seconds field, where
//! day-of-week `0` and `7` both mean Sunday. Evaluation is delegated to the
//! `cron` crate, whose grammar has a mandatory seconds field and numbers
//! weekdays from 1, so expressions are rewritten into that form first.
//!
//! Only the backwards query is needed: when did the schedule last fire.

use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use cron::Schedule;

use crate::error::CoreError;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CoreError> {
        let invalid = |reason: String| CoreError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
        };
        let days_of_week = weekday_names(rest[4]).map_err(&invalid)?;
        let normalized = format!(
            "{seconds} {} {} {} {} {days_of_week}",
            rest[0], rest[1], rest[2], rest[3]
        );

        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Most recent fire time before `now`, evaluated in `now`'s time zone.
    pub fn previous_fire<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(now).next_back()
    }
}

/// Rewrite numeric weekdays (`0`-`7`, Sunday both ends) as names.
fn weekday_names(field: &str) -> Result<String, String> {
    let name = |raw: &str| -> Result<Option<usize>, String> {
        match raw.parse::<usize>() {
            Ok(n) if n <= 7 => Ok(Some(n % 7)),
            Ok(n) => Err(format!("day of week {n} is outside 0-7")),
            Err(_) => Ok(None),
        }
    };

    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };
        let rewritten = match range.split_once('-') {
            Some((a, b)) => match (name(a)?, b.parse::<usize>().ok()) {
                // `5-7` ends on Sunday, which sorts first for the crate.
                (Some(start), Some(7)) if start > 0 => {
                    format!("{}-SAT,SUN", DAY_NAMES[start])
                }
                (Some(0), Some(7)) => "SUN-SAT".to_string(),
                (start, _) => {
                    let start = start.map_or(a.to_string(), |d| DAY_NAMES[d].to_string());
                    let end = name(b)?.map_or(b.to_string(), |d| DAY_NAMES[d].to_string());
                    format!("{start}-{end}")
                }
            },
            None => name(range)?.map_or(range.to_string(), |d| DAY_NAMES[d].to_string()),
        };
        match step {
            Some(_) if rewritten.contains(',') => {
                return Err(format!("step on '{range}' is not supported"));
            }
            Some(step) => parts.push(format!("{rewritten}/{step}")),
            None => parts.push(rewritten),
        }
    }
    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{NaiveDateTime, Timelike, Utc};

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn previous(expression: &str, now: &str) -> Option<DateTime<Utc>> {
        CronSchedule::parse(expression).unwrap().previous_fire(&at(now))
    }

    #[test]
    fn every_fifteen_minutes() {
        assert_eq!(
            previous("*/15 * * * *", "2024-03-10 12:44:10"),
            Some(at("2024-03-10 12:30:00"))
        );
    }

    #[test]
    fn daily_fire_rolls_back_a_day() {
        assert_eq!(
            previous("30 3 * * *", "2024-03-10 02:00:00"),
            Some(at("2024-03-09 03:30:00"))
        );
    }

    #[test]
    fn weekday_names_and_sunday_aliases() {
        // 2024-03-10 is a Sunday.
        assert_eq!(
            previous("0 8 * * MON-FRI", "2024-03-10 12:00:00"),
            Some(at("2024-03-08 08:00:00"))
        );
        assert_eq!(
            previous("0 8 * * 1-5", "2024-03-10 12:00:00"),
            Some(at("2024-03-08 08:00:00"))
        );
        for sunday in ["0", "7"] {
            assert_eq!(
                previous(&format!("0 0 * * {sunday}"), "2024-03-12 12:00:00"),
                Some(at("2024-03-10 00:00:00"))
            );
        }
        // Friday through Sunday.
        assert_eq!(
            previous("0 0 * * 5-7", "2024-03-11 12:00:00"),
            Some(at("2024-03-10 00:00:00"))
        );
    }

    #[test]
    fn weekday_rewrite() {
        assert_eq!(weekday_names("*").unwrap(), "*");
        assert_eq!(weekday_names("1,3").unwrap(), "MON,WED");
        assert_eq!(weekday_names("1-5/2").unwrap(), "MON-FRI/2");
        assert_eq!(weekday_names("0-7").unwrap(), "SUN-SAT");
        assert!(weekday_names("8").is_err());
    }

    #[test]
    fn seconds_field() {
        assert_eq!(
            previous("*/10 * * * * *", "2024-03-10 12:00:37"),
            Some(at("2024-03-10 12:00:30"))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_matches!(
            CronSchedule::parse("* * *"),
            Err(CoreError::InvalidSchedule { .. })
        );
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
        assert!(CronSchedule::parse("0 0 * * 9").is_err());
    }

    #[test]
    fn timezone_aware_query() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        let now = Utc::now();
        let prev = cron.previous_fire(&now).unwrap();
        assert!(prev <= now);
        assert!(now - prev <= chrono::Duration::hours(1));
        assert_eq!(prev.minute(), 0);
    }
}
