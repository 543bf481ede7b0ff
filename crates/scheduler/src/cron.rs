//! Five-field cron expressions for custom recurrence.
//!
//! Format: `MIN HOUR DOM MON DOW`. Each field accepts `*`, `*/N`, `N`,
//! `A-B`, `A-B/N` and comma-separated lists of those. Day-of-week uses
//! 0-6 with Sunday as 0 (7 is also accepted for Sunday). When both DOM and
//! DOW are restricted a day matches if either does, as in classic cron.
//! Matching happens on local wall-clock time.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// How many days ahead a search may look before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "cron expression '{expression}' needs 5 fields (MIN HOUR DOM MON DOW)"
            ));
        }

        let mut days_of_week = parse_field(parts[4], 0, 7)?;
        for d in days_of_week.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn first_time_at_or_after(&self, from: Option<NaiveTime>) -> Option<NaiveTime> {
        for &hour in &self.hours {
            for &minute in &self.minutes {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                if from.is_none_or(|f| time >= f) {
                    return Some(time);
                }
            }
        }
        None
    }

    /// Earliest matching minute at or after `from` (seconds are rounded up
    /// to the next whole minute).
    pub fn next_at_or_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut start = from.with_nanosecond(0)?;
        if start.second() > 0 {
            start = start.with_second(0)? + Duration::minutes(1);
        }

        let mut date = start.date();
        let mut min_time = Some(start.time());
        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.matches_day(date) {
                if let Some(time) = self.first_time_at_or_after(min_time) {
                    return Some(date.and_time(time));
                }
            }
            date = date.succ_opt()?;
            min_time = None;
        }
        None
    }

    /// Earliest matching minute strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let base = after.with_second(0)?.with_nanosecond(0)?;
        self.next_at_or_after(base + Duration::minutes(1))
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, String> {
    let mut values = Vec::new();
    for part in field.split(',') {
        values.extend(parse_part(part.trim(), min, max)?);
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(format!("cron field '{field}' matches nothing"));
    }
    Ok(values)
}

fn parse_part(part: &str, min: u32, max: u32) -> Result<Vec<u32>, String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid cron step '{step}'"))?;
            if step == 0 {
                return Err("cron step must be positive".to_string());
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, min, max)?, parse_value(b, min, max)?)
    } else {
        let v = parse_value(range, min, max)?;
        // "N/step" runs from N to the end of the field.
        if step > 1 {
            (v, max)
        } else {
            (v, v)
        }
    };
    if lo > hi {
        return Err(format!("cron range '{range}' is reversed"));
    }
    Ok((lo..=hi).step_by(step as usize).collect())
}

fn parse_value(value: &str, min: u32, max: u32) -> Result<u32, String> {
    let n: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid cron value '{value}'"))?;
    if n < min || n > max {
        return Err(format!("cron value {n} outside {min}-{max}"));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_every_day_at_eight() {
        let cron = CronExpr::parse("0 8 * * *").unwrap();
        assert_eq!(cron.next_at_or_after(at(2024, 3, 1, 7, 0)), Some(at(2024, 3, 1, 8, 0)));
        assert_eq!(cron.next_at_or_after(at(2024, 3, 1, 8, 0)), Some(at(2024, 3, 1, 8, 0)));
        assert_eq!(cron.next_after(at(2024, 3, 1, 8, 0)), Some(at(2024, 3, 2, 8, 0)));
    }

    #[test]
    fn test_every_15_minutes() {
        let cron = CronExpr::parse("*/15 * * * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 10, 2)), Some(at(2024, 3, 1, 10, 15)));
        assert_eq!(cron.next_after(at(2024, 3, 1, 23, 50)), Some(at(2024, 3, 2, 0, 0)));
    }

    #[test]
    fn test_weekdays_and_lists() {
        // 2024-03-01 is a Friday.
        let cron = CronExpr::parse("30 9 * * 1-5").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 10, 0)), Some(at(2024, 3, 4, 9, 30)));

        let cron = CronExpr::parse("0 12 1,15 * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 12, 0)), Some(at(2024, 3, 15, 12, 0)));
    }

    #[test]
    fn test_dom_or_dow() {
        // Fire on the 10th or on any Sunday.
        let cron = CronExpr::parse("0 0 10 * 0").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 0, 0)), Some(at(2024, 3, 3, 0, 0)));
        assert_eq!(cron.next_after(at(2024, 3, 9, 0, 0)), Some(at(2024, 3, 10, 0, 0)));
    }

    #[test]
    fn test_leap_day_only() {
        let cron = CronExpr::parse("0 9 29 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 9, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronExpr::parse("bad").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("0 5-2 * * *").is_err());
    }
}
