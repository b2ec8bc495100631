//! Five-field cron expressions for event schedules.
//!
//! `minute hour day month weekday` with `*`, `*/n`, `a-b` and `a,b,c`;
//! weekday 0 and 7 both mean Sunday. No seconds field. Fire times are
//! minute-aligned and strictly after the reference instant.

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use std::collections::BTreeSet;

use crate::error::{OntoError, Result};

/// Compiled cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

fn parse_field(field: &str, minimum: u32, maximum: u32) -> Result<BTreeSet<u32>> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let token = part.trim();
        if token == "*" {
            values.extend(minimum..=maximum);
            continue;
        }
        if let Some(step_str) = token.strip_prefix("*/") {
            let step: u32 = step_str
                .parse()
                .map_err(|_| OntoError::Cron(format!("invalid cron step '{token}'")))?;
            if step == 0 {
                return Err(OntoError::Cron(format!("invalid cron step '{token}'")));
            }
            values.extend((minimum..=maximum).step_by(step as usize));
            continue;
        }
        if let Some((lo_str, hi_str)) = token.split_once('-') {
            let lo: u32 = lo_str
                .parse()
                .map_err(|_| OntoError::Cron(format!("invalid cron range '{token}'")))?;
            let hi: u32 = hi_str
                .parse()
                .map_err(|_| OntoError::Cron(format!("invalid cron range '{token}'")))?;
            if lo > hi {
                return Err(OntoError::Cron(format!("invalid cron range '{token}'")));
            }
            if lo < minimum || hi > maximum {
                return Err(OntoError::Cron(format!("cron range out of bounds '{token}'")));
            }
            values.extend(lo..=hi);
            continue;
        }
        let value: u32 = token
            .parse()
            .map_err(|_| OntoError::Cron(format!("invalid cron value '{token}'")))?;
        if value < minimum || value > maximum {
            return Err(OntoError::Cron(format!("cron value out of bounds '{token}'")));
        }
        values.insert(value);
    }
    Ok(values)
}

impl CronSpec {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(OntoError::Cron(format!(
                "cron expression must have 5 fields: '{expr}'"
            )));
        }
        Ok(CronSpec {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            weekdays: parse_field(parts[4], 0, 7)?,
        })
    }

    /// Whether a minute-aligned instant matches this expression.
    pub fn matches(&self, dt: DateTime<Utc>) -> bool {
        // chrono: Monday=0 .. Sunday=6; cron: Sunday=0/7, Monday=1 ..
        let cron_weekday = (dt.weekday().num_days_from_monday() + 1) % 7;
        let weekday_match = self.weekdays.contains(&cron_weekday)
            || (cron_weekday == 0 && self.weekdays.contains(&7));

        self.minutes.contains(&dt.minute())
            && self.hours.contains(&dt.hour())
            && self.days.contains(&dt.day())
            && self.months.contains(&dt.month())
            && weekday_match
    }

    /// The first matching minute strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut candidate = after
            .duration_trunc(Duration::minutes(1))
            .map_err(|e| OntoError::Cron(e.to_string()))?
            + Duration::minutes(1);
        // One year of minutes bounds the search.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }
        Err(OntoError::Cron(
            "unable to find next cron trigger within one year".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn wildcard_matches_every_minute() {
        let spec = CronSpec::parse("* * * * *").unwrap();
        let t = at(2024, 6, 1, 12, 30);
        assert_eq!(spec.next_fire(t).unwrap(), at(2024, 6, 1, 12, 31));
    }

    #[test]
    fn step_ranges_and_lists() {
        let spec = CronSpec::parse("*/15 9-17 * * 1,2,3").unwrap();
        // 2024-06-03 is a Monday.
        let t = at(2024, 6, 3, 8, 50);
        assert_eq!(spec.next_fire(t).unwrap(), at(2024, 6, 3, 9, 0));
        assert!(spec.matches(at(2024, 6, 3, 9, 45)));
        assert!(!spec.matches(at(2024, 6, 3, 9, 10)));
    }

    #[test]
    fn weekday_seven_is_sunday() {
        let spec = CronSpec::parse("0 0 * * 7").unwrap();
        // 2024-06-02 is a Sunday.
        assert!(spec.matches(at(2024, 6, 2, 0, 0)));
        let zero = CronSpec::parse("0 0 * * 0").unwrap();
        assert!(zero.matches(at(2024, 6, 2, 0, 0)));
        assert!(!zero.matches(at(2024, 6, 3, 0, 0)));
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let spec = CronSpec::parse("30 12 * * *").unwrap();
        let exactly = at(2024, 6, 1, 12, 30);
        assert_eq!(spec.next_fire(exactly).unwrap(), at(2024, 6, 2, 12, 30));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronSpec::parse("* * * *").is_err());
        assert!(CronSpec::parse("61 * * * *").is_err());
        assert!(CronSpec::parse("*/0 * * * *").is_err());
        assert!(CronSpec::parse("5-1 * * * *").is_err());
    }
}
