//! Calendar helpers for snapshot bucketing and retention windows.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// True when `date` is the final calendar day of its month.
pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    match date.succ_opt() {
        Some(tomorrow) => tomorrow.month() != date.month(),
        None => true,
    }
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

pub fn month_end(date: NaiveDate) -> NaiveDate {
    let start = month_start(date);
    start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// First day of the month `delta` months away from the month containing `date`.
pub fn shift_months(date: NaiveDate, delta: i32) -> Option<NaiveDate> {
    let start = month_start(date);
    if delta >= 0 {
        start.checked_add_months(Months::new(delta.unsigned_abs()))
    } else {
        start.checked_sub_months(Months::new(delta.unsigned_abs()))
    }
}

/// `YYYY-MM` label for the month containing `date`.
pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

pub fn parse_month_key(value: &str) -> Option<NaiveDate> {
    let (year, month) = value.trim().split_once('-')?;
    if month.len() != 2 {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn month(date: NaiveDate) -> Self {
        Self::new(month_start(date), month_end(date))
    }

    pub fn year(year: i32) -> Option<Self> {
        Some(Self::new(
            NaiveDate::from_ymd_opt(year, 1, 1)?,
            NaiveDate::from_ymd_opt(year, 12, 31)?,
        ))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// First-of-month dates for every month the range touches.
    pub fn months(&self) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut cursor = month_start(self.start);
        while cursor <= self.end {
            out.push(cursor);
            match cursor.checked_add_months(Months::new(1)) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        out
    }
}
