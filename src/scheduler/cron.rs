//! Five-field cron triggers: `minute hour day month day-of-week`.
//!
//! A field written as a bare `*` is recorded as `None` (no constraint) rather
//! than handed on as a literal wildcard. Fire times come from
//! [`cron::Schedule`] and are computed in UTC.
//!
//! Day-of-week counts from Monday: `0` is Monday and `6` is Sunday.
//! Three-letter names (`mon`..`sun`) are accepted too.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

use crate::errors::{BackupError, Result};

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    Day,
    Month,
    DayOfWeek,
}

impl CronField {
    pub const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::Day,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::Day => "day",
            CronField::Month => "month",
            CronField::DayOfWeek => "day_of_week",
        }
    }

    fn index(&self) -> usize {
        match self {
            CronField::Minute => 0,
            CronField::Hour => 1,
            CronField::Day => 2,
            CronField::Month => 3,
            CronField::DayOfWeek => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    fields: [Option<String>; 5],
    schedule: Schedule,
}

impl CronTrigger {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| {
            BackupError::config(format!("Invalid cron expression '{}': {}", expression, reason))
        };

        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(format!("expected 5 fields, got {}", parts.len())));
        }
        for (part, field) in parts.iter().zip(CronField::ALL) {
            if part.split(',').any(|item| item.split_once('/').is_some_and(|(_, step)| step.parse::<u32>() == Ok(0))) {
                return Err(invalid(format!("step must be positive in {} field", field.name())));
            }
        }

        let day_of_week = translate_day_of_week(parts[4]).map_err(invalid)?;
        // The cron crate wants a leading seconds field.
        let full = format!("0 {} {} {} {} {}", parts[0], parts[1], parts[2], parts[3], day_of_week);
        let schedule = Schedule::from_str(&full).map_err(|e| invalid(e.to_string()))?;

        let fields = [0, 1, 2, 3, 4].map(|i| (parts[i] != "*").then(|| parts[i].to_string()));
        Ok(Self {
            expression: parts.join(" "),
            fields,
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The field as written, `None` when it is unconstrained.
    pub fn field(&self, field: CronField) -> Option<&str> {
        self.fields[field.index()].as_deref()
    }

    /// `cron[minute='30', hour='2']`, listing only constrained fields.
    pub fn describe(&self) -> String {
        let fields: Vec<String> = CronField::ALL
            .iter()
            .filter_map(|f| self.field(*f).map(|source| format!("{}='{}'", f.name(), source)))
            .collect();
        format!("cron[{}]", fields.join(", "))
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The next `count` fire times after `after`.
    pub fn next_fire_times(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&after).take(count).collect()
    }
}

impl FromStr for CronTrigger {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        CronTrigger::parse(s)
    }
}

impl fmt::Display for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Rewrites Monday-based day numbers as names, which the cron crate reads
/// without ambiguity. Ranges and steps are expanded into explicit lists, so
/// a range ending on Sunday never wraps in the crate's Sunday-first week.
fn translate_day_of_week(text: &str) -> std::result::Result<String, String> {
    if text == "*" {
        return Ok(text.to_string());
    }
    let items = text
        .split(',')
        .map(|item| -> std::result::Result<String, String> {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: usize = step
                        .parse()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| format!("invalid step '{}' in day_of_week field", step))?;
                    (range, Some(step))
                }
                None => (item, None),
            };
            let (first, last) = if range == "*" {
                (0, WEEKDAYS.len() - 1)
            } else if let Some((a, b)) = range.split_once('-') {
                (weekday(a)?, weekday(b)?)
            } else {
                let day = weekday(range)?;
                (day, if step.is_some() { WEEKDAYS.len() - 1 } else { day })
            };
            if first > last {
                return Err(format!("range '{}' is reversed in day_of_week field", range));
            }
            Ok((first..=last)
                .step_by(step.unwrap_or(1))
                .map(|i| WEEKDAYS[i])
                .collect::<Vec<_>>()
                .join(","))
        })
        .collect::<std::result::Result<Vec<String>, String>>()?;
    Ok(items.join(","))
}

/// Index into [`WEEKDAYS`] for a number (0 = Monday) or a three-letter name.
fn weekday(value: &str) -> std::result::Result<usize, String> {
    let lower = value.trim().to_ascii_lowercase();
    let index = match lower.parse::<usize>() {
        Ok(number) => Some(number).filter(|n| *n < WEEKDAYS.len()),
        Err(_) => WEEKDAYS.iter().position(|name| name.to_ascii_lowercase() == lower),
    };
    index.ok_or_else(|| format!("invalid value '{}' in day_of_week field (0-6, Monday is 0)", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn wildcards_are_left_unconstrained() -> Result<()> {
        let trigger = CronTrigger::parse("30 2 * * *")?;
        assert_eq!(trigger.field(CronField::Day), None);
        assert_eq!(trigger.field(CronField::Month), None);
        assert_eq!(trigger.field(CronField::DayOfWeek), None);
        assert_eq!(trigger.field(CronField::Minute), Some("30"));
        assert_eq!(trigger.field(CronField::Hour), Some("2"));
        Ok(())
    }

    #[test]
    fn stepped_wildcard_is_a_constraint() -> Result<()> {
        let trigger = CronTrigger::parse("*/15 * * * *")?;
        assert_eq!(trigger.field(CronField::Minute), Some("*/15"));
        assert_eq!(
            trigger.next_fire_times(utc(2024, 5, 1, 10, 5), 3),
            vec![utc(2024, 5, 1, 10, 15), utc(2024, 5, 1, 10, 30), utc(2024, 5, 1, 10, 45)]
        );
        Ok(())
    }

    #[test]
    fn describe_lists_constrained_fields() -> Result<()> {
        assert_eq!(CronTrigger::parse("30 2 * * *")?.describe(), "cron[minute='30', hour='2']");
        assert_eq!(
            CronTrigger::parse("0 4 * * 1")?.describe(),
            "cron[minute='0', hour='4', day_of_week='1']"
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "* * * *", "* * * * * *", "60 * * * *", "* 24 * * *", "* * 0 * *", "*/0 * * * *", "x * * * *", "0 0 * * 7"] {
            assert!(
                matches!(CronTrigger::parse(bad), Err(BackupError::Config(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn day_of_week_counts_from_monday() -> Result<()> {
        // 2024-05-01 is a Wednesday.
        let monday = CronTrigger::parse("0 3 * * 0")?;
        let next = monday.next_fire_after(utc(2024, 5, 1, 12, 0));
        assert_eq!(next, Some(utc(2024, 5, 6, 3, 0)));
        assert_eq!(next.map(|t| t.weekday()), Some(Weekday::Mon));

        let sunday = CronTrigger::parse("0 3 * * 6")?;
        assert_eq!(sunday.next_fire_after(utc(2024, 5, 1, 12, 0)), Some(utc(2024, 5, 5, 3, 0)));
        Ok(())
    }

    #[test]
    fn day_of_week_lists_ranges_and_names() -> Result<()> {
        assert_eq!(translate_day_of_week("0-4").as_deref(), Ok("Mon,Tue,Wed,Thu,Fri"));
        assert_eq!(translate_day_of_week("5,6").as_deref(), Ok("Sat,Sun"));
        assert_eq!(translate_day_of_week("sat-sun").as_deref(), Ok("Sat,Sun"));
        assert_eq!(translate_day_of_week("*/2").as_deref(), Ok("Mon,Wed,Fri,Sun"));
        assert_eq!(translate_day_of_week("4/2").as_deref(), Ok("Fri,Sun"));
        assert!(translate_day_of_week("fri-mon").is_err());

        let weekdays = CronTrigger::parse("0,30 9 * Jan,Jul mon-fri")?;
        let times = weekdays.next_fire_times(utc(2024, 7, 5, 10, 0), 3);
        // Friday 5 July, then the weekend is skipped.
        assert_eq!(times, vec![utc(2024, 7, 8, 9, 0), utc(2024, 7, 8, 9, 30), utc(2024, 7, 9, 9, 0)]);
        Ok(())
    }

    #[test]
    fn daily_next_fire() -> Result<()> {
        let trigger = CronTrigger::parse("30 2 * * *")?;
        assert_eq!(trigger.next_fire_after(utc(2024, 5, 1, 1, 0)), Some(utc(2024, 5, 1, 2, 30)));
        // Exactly at a fire time: the next one is tomorrow.
        assert_eq!(trigger.next_fire_after(utc(2024, 5, 1, 2, 30)), Some(utc(2024, 5, 2, 2, 30)));
        assert_eq!(trigger.next_fire_after(utc(2024, 12, 31, 23, 59)), Some(utc(2025, 1, 1, 2, 30)));
        Ok(())
    }

    #[test]
    fn monthly_next_fire_skips_short_months() -> Result<()> {
        let trigger = CronTrigger::parse("0 0 31 * *")?;
        assert_eq!(trigger.next_fire_after(utc(2024, 4, 1, 0, 0)), Some(utc(2024, 5, 31, 0, 0)));
        let leap = CronTrigger::parse("0 0 29 2 *")?;
        assert_eq!(leap.next_fire_after(utc(2024, 3, 1, 0, 0)), Some(utc(2028, 2, 29, 0, 0)));
        Ok(())
    }

    #[test]
    fn both_day_fields_must_match() -> Result<()> {
        // The 13th only when it is a Friday (4).
        let trigger = CronTrigger::parse("0 0 13 * 4")?;
        assert_eq!(trigger.next_fire_after(utc(2024, 1, 1, 0, 0)), Some(utc(2024, 9, 13, 0, 0)));
        Ok(())
    }

    #[test]
    fn next_fire_times_are_consecutive() -> Result<()> {
        let trigger = CronTrigger::parse("*/20 * * * *")?;
        assert_eq!(
            trigger.next_fire_times(utc(2024, 5, 1, 10, 5), 4),
            vec![
                utc(2024, 5, 1, 10, 20),
                utc(2024, 5, 1, 10, 40),
                utc(2024, 5, 1, 11, 0),
                utc(2024, 5, 1, 11, 20)
            ]
        );
        Ok(())
    }
}
