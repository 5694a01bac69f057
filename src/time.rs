//! Reference time zone used for day and month bucketing
//!
//! The zone is a fixed UTC offset chosen at configuration time. Both the write
//! path (which aggregate row a record lands in) and the read path (what
//! "today" and "this month" mean) go through the same `ReferenceZone`.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

/// Calendar month in the reference zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    offset: FixedOffset,
}

impl ReferenceZone {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn from_offset(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local calendar date of an instant
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// Local calendar month of an instant
    pub fn month_of(&self, instant: DateTime<Utc>) -> YearMonth {
        let date = self.date_of(instant);
        YearMonth {
            year: date.year(),
            month: date.month(),
        }
    }

    /// First instant of a local date, as UTC
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::default());
        // Fixed offsets have no gaps or folds, so the mapping is always single.
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }

    /// Half-open UTC range `[start, end)` covering the local dates `first..=last`
    pub fn utc_range(&self, first: NaiveDate, last: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let end_date = last.checked_add_days(Days::new(1)).unwrap_or(last);
        (self.start_of_day(first), self.start_of_day(end_date))
    }

    /// Half-open UTC range covering a local calendar month
    pub fn month_range(&self, month: YearMonth) -> (DateTime<Utc>, DateTime<Utc>) {
        let first = NaiveDate::from_ymd_opt(month.year, month.month, 1)
            .unwrap_or(NaiveDate::MIN);
        let next = if month.month == 12 {
            NaiveDate::from_ymd_opt(month.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(month.year, month.month + 1, 1)
        }
        .unwrap_or(NaiveDate::MAX);
        (self.start_of_day(first), self.start_of_day(next))
    }
}

impl Default for ReferenceZone {
    fn default() -> Self {
        Self::utc()
    }
}

impl fmt::Display for ReferenceZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.offset)
    }
}

impl FromStr for ReferenceZone {
    type Err = String;

    /// Accepts `UTC`, `Z`, `+HH:MM`, `-HH:MM`, `+HHMM` and `+HH`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(Self::utc());
        }

        let (sign, rest) = match s.chars().next() {
            Some('+') => (1, &s[1..]),
            Some('-') => (-1, &s[1..]),
            _ => return Err(format!("invalid UTC offset '{}', expected e.g. +05:30", s)),
        };

        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if !digits.chars().all(|c| c.is_ascii_digit()) || !(digits.len() == 2 || digits.len() == 4) {
            return Err(format!("invalid UTC offset '{}', expected e.g. +05:30", s));
        }

        let hours: i32 = digits[..2].parse().map_err(|_| format!("invalid hours in '{}'", s))?;
        let minutes: i32 = if digits.len() == 4 {
            digits[2..].parse().map_err(|_| format!("invalid minutes in '{}'", s))?
        } else {
            0
        };

        if hours > 23 || minutes > 59 {
            return Err(format!("UTC offset '{}' out of range", s));
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self::from_offset)
            .ok_or_else(|| format!("UTC offset '{}' out of range", s))
    }
}
