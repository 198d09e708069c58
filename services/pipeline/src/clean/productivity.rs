//! Productivity cleaner: batch log rows into timed batches.

use super::{parse_clock, parse_date, parse_int, DropLog, DropReason, MINUTE_DP};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::source::Dataset;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductivityRow {
    pub line: usize,
    pub batch_id: i64,
    pub date: NaiveDate,
    pub product_code: String,
    pub operator: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(with = "rust_decimal::serde::float")]
    pub duration_minutes: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductivityTable {
    pub rows: Vec<ProductivityRow>,
    pub drops: DropLog,
}

/// Shift an end that precedes its start by exactly one day.
/// Returns the corrected end and whether a shift happened.
pub fn correct_cross_midnight(start: NaiveDateTime, end: NaiveDateTime) -> (NaiveDateTime, bool) {
    if end < start {
        (end + Duration::hours(24), true)
    } else {
        (end, false)
    }
}

pub fn duration_minutes(start: NaiveDateTime, end: NaiveDateTime) -> Decimal {
    (Decimal::from((end - start).num_seconds()) / Decimal::from(60)).round_dp(MINUTE_DP)
}

pub fn clean_productivity(ds: &Dataset, config: &PipelineConfig) -> Result<ProductivityTable> {
    let cols = &config.columns;
    let date_col = ds.require_column(&cols.date)?;
    let product_col = ds.require_column(&cols.product)?;
    let batch_col = ds.require_column(&cols.batch)?;
    let operator_col = ds.require_column(&cols.operator)?;
    let start_col = ds.require_column(&cols.start_time)?;
    let end_col = ds.require_column(&cols.end_time)?;
    let required = [date_col, product_col, batch_col, operator_col, start_col, end_col];
    let max_span = Decimal::from(config.max_span_hours * 60);

    let mut rows = Vec::with_capacity(ds.len());
    let mut drops = DropLog::default();
    let mut corrected = 0usize;

    for row in &ds.rows {
        if required.iter().any(|&c| row.get(c).is_empty()) {
            drops.record(DropReason::MissingValue);
            continue;
        }

        let Some(batch_id) = parse_int(row.get(batch_col)) else {
            drops.record(DropReason::ParseFailure);
            continue;
        };
        let Some(date) = parse_date(row.get(date_col), config) else {
            drops.record(DropReason::ParseFailure);
            continue;
        };
        let (Some(start), Some(end)) = (
            parse_clock(date, row.get(start_col), config),
            parse_clock(date, row.get(end_col), config),
        ) else {
            drops.record(DropReason::ParseFailure);
            continue;
        };

        let (end, shifted) = correct_cross_midnight(start, end);
        if shifted {
            corrected += 1;
        }

        let duration = duration_minutes(start, end);
        if duration <= Decimal::ZERO {
            drops.record(DropReason::NonPositiveDuration);
            continue;
        }
        if duration > max_span {
            drops.record(DropReason::MultiDaySpan);
            continue;
        }

        rows.push(ProductivityRow {
            line: row.line,
            batch_id,
            date,
            product_code: row.get(product_col).to_string(),
            operator: row.get(operator_col).to_string(),
            start,
            end,
            duration_minutes: duration,
        });
    }

    log::info!(
        "productivity: kept {} of {} rows ({} cross-midnight corrected)",
        rows.len(),
        ds.len(),
        corrected
    );
    drops.report("productivity");

    Ok(ProductivityTable { rows, drops })
}
