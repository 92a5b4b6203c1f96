//! Calendar date helpers.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::FormatError;

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, FormatError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| FormatError::Date(s.to_string()))
}

/// Every calendar date from `start` to `end`, both inclusive.
///
/// Empty when `start > end`.
pub fn expand_dates(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current);
        current += Duration::days(1);
    }
    dates
}

/// Optional inclusive date bounds used to filter catalog selections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,
}

impl DateRange {
    /// A range with no bounds.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Self, FormatError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(FormatError::DateRange { start: s, end: e });
            }
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}
