use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Query granularity selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "period")]
pub enum Period {
    /// Everything ever recorded
    All,
    /// The current local day in the reference zone
    Today,
    /// The current local month in the reference zone
    Month,
    /// Raw records of one session
    Session,
    /// Inclusive range of local dates
    Range { start: NaiveDate, end: NaiveDate },
}

impl Period {
    /// Human-readable label used in reports
    pub fn label(&self) -> String {
        match self {
            Self::All => "All Time".to_string(),
            Self::Today => "Today".to_string(),
            Self::Month => "This Month".to_string(),
            Self::Session => "Current Session".to_string(),
            Self::Range { start, end } => format!("{} to {}", start, end),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Today => f.write_str("today"),
            Self::Month => f.write_str("month"),
            Self::Session => f.write_str("session"),
            Self::Range { start, end } => write!(f, "{}..{}", start, end),
        }
    }
}

impl FromStr for Period {
    type Err = LedgerError;

    /// Parses `all`, `today`, `month`, `session` or `YYYY-MM-DD..YYYY-MM-DD`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "today" => Ok(Self::Today),
            "month" => Ok(Self::Month),
            "session" => Ok(Self::Session),
            other => {
                let (start, end) = other.split_once("..").ok_or_else(|| {
                    LedgerError::InvalidInput(format!(
                        "unknown period '{}', expected all, today, month, session or START..END",
                        s
                    ))
                })?;
                let parse = |d: &str| {
                    NaiveDate::parse_from_str(d, "%Y-%m-%d")
                        .map_err(|e| LedgerError::InvalidInput(format!("invalid date '{}': {}", d, e)))
                };
                range(parse(start)?, parse(end)?)
            }
        }
    }
}

/// Build a `Period::Range`, rejecting reversed bounds
pub fn range(start: NaiveDate, end: NaiveDate) -> Result<Period, LedgerError> {
    if start > end {
        return Err(LedgerError::InvalidInput(format!(
            "range start {} is after end {}",
            start, end
        )));
    }
    Ok(Period::Range { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_periods() {
        assert_eq!("all".parse::<Period>().unwrap(), Period::All);
        assert_eq!("TODAY".parse::<Period>().unwrap(), Period::Today);
        assert_eq!("month".parse::<Period>().unwrap(), Period::Month);
        assert_eq!("session".parse::<Period>().unwrap(), Period::Session);
        assert!("week".parse::<Period>().is_err());
    }

    #[test]
    fn test_parse_range() {
        let period: Period = "2025-01-01..2025-01-31".parse().unwrap();
        assert_eq!(
            period,
            Period::Range {
                start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            }
        );
        assert_eq!(period.to_string(), "2025-01-01..2025-01-31");

        assert!("2025-02-01..2025-01-01".parse::<Period>().is_err());
        assert!("2025-02-01..tomorrow".parse::<Period>().is_err());
    }

    #[test]
    fn test_labels() {
        assert_eq!(Period::All.label(), "All Time");
        assert_eq!(Period::Session.label(), "Current Session");
    }
}
