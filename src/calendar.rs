use chrono::{Datelike, NaiveDate, Utc};

use crate::model::{Day, Ms};

/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised date {0:?}")]
pub struct DateError(pub String);

/// Converts submitted date strings to day indices.
pub trait DayCalendar: Send + Sync {
    /// Empty input means "not set" and is not an error.
    fn day_index(&self, date: &str) -> Result<Option<Day>, DateError>;

    fn today(&self) -> Day;
}

/// Accepts `YYYY-MM-DD` and `MM/DD/YYYY`; day 0 is 1970-01-01 (UTC).
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoCalendar;

impl DayCalendar for IsoCalendar {
    fn day_index(&self, date: &str) -> Result<Option<Day>, DateError> {
        let trimmed = date.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
            .map(|d| Some(day_of(d)))
            .ok_or_else(|| DateError(trimmed.to_string()))
    }

    fn today(&self) -> Day {
        day_of(Utc::now().date_naive())
    }
}

pub fn day_of(date: NaiveDate) -> Day {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_day_zero() {
        assert_eq!(IsoCalendar.day_index("1970-01-01"), Ok(Some(0)));
        assert_eq!(IsoCalendar.day_index("1970-01-11"), Ok(Some(10)));
        assert_eq!(IsoCalendar.day_index("1969-12-31"), Ok(Some(-1)));
    }

    #[test]
    fn us_format_matches_iso() {
        let iso = IsoCalendar.day_index("2024-03-01").unwrap();
        let us = IsoCalendar.day_index("03/01/2024").unwrap();
        assert_eq!(iso, us);
        assert_eq!(iso, Some(19_783));
    }

    #[test]
    fn blank_is_unset() {
        assert_eq!(IsoCalendar.day_index(""), Ok(None));
        assert_eq!(IsoCalendar.day_index("   "), Ok(None));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(IsoCalendar.day_index("next tuesday").is_err());
        assert!(IsoCalendar.day_index("2024-02-30").is_err());
    }
}
