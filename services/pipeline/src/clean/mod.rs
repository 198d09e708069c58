//! Cleaners: one per raw source, each turning a raw [`Dataset`] into a
//! validated, typed dataset.
//!
//! Row-level problems are absorbed here. A row that cannot be coerced is
//! dropped and its reason counted in a [`DropLog`]; only schema problems
//! (missing columns, duplicate keys under the `fail` policy, ambiguous
//! operator-error columns) surface as errors.
//!
//! [`Dataset`]: crate::source::Dataset

pub mod dimensions;
pub mod downtime;
pub mod productivity;

use crate::config::PipelineConfig;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Decimal places kept on every minute quantity (microminutes). Sums and
/// differences at this scale are exact.
pub const MINUTE_DP: u32 = 6;

pub use dimensions::{clean_factors, clean_products, FactorTable, ProductTable};
pub use downtime::{clean_downtime, DowntimeTable};
pub use productivity::{clean_productivity, ProductivityRow, ProductivityTable};

/// Why a row left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MissingValue,
    ParseFailure,
    NonPositiveDuration,
    MultiDaySpan,
    SpuriousHeaderRow,
    DuplicateKey,
    DuplicateBatch,
    OrphanDowntime,
    MissingProduct,
}

/// Per-reason drop counters for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DropLog {
    counts: BTreeMap<DropReason, usize>,
}

impl DropLog {
    pub fn record(&mut self, reason: DropReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn count(&self, reason: DropReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Log the non-zero counters of `stage` at warn level.
    pub fn report(&self, stage: &str) {
        for (reason, count) in &self.counts {
            log::warn!("{}: dropped {} row(s) ({:?})", stage, count, reason);
        }
    }
}

/// Integer key. Integral floats ("101.0", common in spreadsheet exports) are accepted.
pub(crate) fn parse_int(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    let f = s.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(f as i64)
    } else {
        None
    }
}

/// Minute quantity, plain or scientific notation, rounded to [`MINUTE_DP`].
pub(crate) fn parse_minutes(raw: &str) -> Option<Decimal> {
    let s = raw.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
        .map(|v| v.round_dp(MINUTE_DP))
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "t" | "1" => Some(true),
        "no" | "n" | "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a date, also accepting a full timestamp and keeping its date part.
pub(crate) fn parse_date(raw: &str, config: &PipelineConfig) -> Option<NaiveDate> {
    let s = raw.trim();
    config
        .date_formats
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .or_else(|| {
            config
                .datetime_formats
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                .map(|dt| dt.date())
        })
}

/// Parse a start/end value. Full timestamps are taken as-is, times of day
/// are combined with `date`.
pub(crate) fn parse_clock(
    date: NaiveDate,
    raw: &str,
    config: &PipelineConfig,
) -> Option<NaiveDateTime> {
    let s = raw.trim();
    config
        .datetime_formats
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            config
                .time_formats
                .iter()
                .find_map(|f| NaiveTime::parse_from_str(s, f).ok())
                .map(|t| date.and_time(t))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_variants() {
        assert_eq!(parse_int("101"), Some(101));
        assert_eq!(parse_int(" 101 "), Some(101));
        assert_eq!(parse_int("101.0"), Some(101));
        assert_eq!(parse_int("101.5"), None);
        assert_eq!(parse_int("Batch"), None);
        assert_eq!(parse_int(""), None);
    }

    #[test]
    fn test_parse_minutes() {
        assert_eq!(parse_minutes("20"), Some(Decimal::from(20)));
        assert_eq!(parse_minutes(" 2.5 "), Some(Decimal::new(25, 1)));
        assert_eq!(parse_minutes("1.5e1"), Some(Decimal::from(15)));
        assert_eq!(parse_minutes("0.12345678"), Some(Decimal::new(123457, 6)));
        assert_eq!(parse_minutes("NaN"), None);
        assert_eq!(parse_minutes("inf"), None);
        assert_eq!(parse_minutes("n/a"), None);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("N"), Some(false));
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_parse_date_accepts_timestamp() {
        let config = PipelineConfig::default();
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(parse_date("2024-01-01", &config), Some(expected));
        assert_eq!(parse_date("2024-01-01 00:00:00", &config), Some(expected));
        assert_eq!(parse_date("01/13/2024", &config), NaiveDate::from_ymd_opt(2024, 1, 13));
        assert_eq!(parse_date("yesterday", &config), None);
    }

    #[test]
    fn test_parse_clock_time_of_day_and_full() {
        let config = PipelineConfig::default();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let eight = date.and_hms_opt(8, 0, 0).unwrap();
        assert_eq!(parse_clock(date, "08:00", &config), Some(eight));
        assert_eq!(parse_clock(date, "08:00:00", &config), Some(eight));
        let other = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(1, 30, 0).unwrap();
        assert_eq!(parse_clock(date, "2024-01-02 01:30", &config), Some(other));
        assert_eq!(parse_clock(date, "25:00", &config), None);
    }

    #[test]
    fn test_drop_log_counts() {
        let mut log = DropLog::default();
        assert!(log.is_empty());
        log.record(DropReason::ParseFailure);
        log.record(DropReason::ParseFailure);
        log.record(DropReason::MissingValue);
        assert_eq!(log.count(DropReason::ParseFailure), 2);
        assert_eq!(log.count(DropReason::DuplicateKey), 0);
        assert_eq!(log.total(), 3);
        assert_eq!(
            serde_json::to_value(&log).unwrap(),
            serde_json::json!({ "missing_value": 1, "parse_failure": 2 })
        );
    }
}
