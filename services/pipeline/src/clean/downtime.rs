//! Downtime cleaner: keeps the wide shape, fixes keys and minute cells.

use super::{parse_int, parse_minutes, DropLog, DropReason};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::source::Dataset;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub struct DowntimeRow {
    pub batch_id: i64,
    /// Minutes per factor, aligned with [`DowntimeTable::factor_columns`].
    pub minutes: Vec<Decimal>,
}

impl DowntimeRow {
    pub fn total(&self) -> Decimal {
        self.minutes.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DowntimeTable {
    /// Every non-key column, in source order.
    pub factor_columns: Vec<String>,
    pub rows: Vec<DowntimeRow>,
    pub drops: DropLog,
    /// Non-empty cells that failed numeric coercion and were read as 0.
    pub zero_filled: usize,
}

pub fn clean_downtime(ds: &Dataset, config: &PipelineConfig) -> Result<DowntimeTable> {
    let key = config.columns.batch.trim();
    let batch_col = ds.require_column(key)?;
    let factor_idx: Vec<usize> = (0..ds.headers.len())
        .filter(|&i| i != batch_col && !ds.headers[i].is_empty())
        .collect();
    let factor_columns = factor_idx.iter().map(|&i| ds.headers[i].clone()).collect();

    let mut rows = Vec::with_capacity(ds.len());
    let mut drops = DropLog::default();
    let mut zero_filled = 0usize;

    for row in &ds.rows {
        let raw_key = row.get(batch_col);
        if raw_key == key {
            drops.record(DropReason::SpuriousHeaderRow);
            continue;
        }
        let Some(batch_id) = parse_int(raw_key) else {
            drops.record(DropReason::ParseFailure);
            continue;
        };

        let minutes = factor_idx
            .iter()
            .map(|&i| {
                let cell = row.get(i);
                parse_minutes(cell).unwrap_or_else(|| {
                    if !cell.is_empty() {
                        zero_filled += 1;
                    }
                    Decimal::ZERO
                })
            })
            .collect();

        rows.push(DowntimeRow {
            batch_id,
            minutes,
        });
    }

    log::info!(
        "downtime: kept {} of {} rows, {} factor columns, {:.1} min recorded",
        rows.len(),
        ds.len(),
        factor_idx.len(),
        rows.iter().map(DowntimeRow::total).sum::<Decimal>()
    );
    if zero_filled > 0 {
        log::warn!("downtime: {} non-numeric minute cell(s) read as 0", zero_filled);
    }
    drops.report("downtime");

    Ok(DowntimeTable {
        factor_columns,
        rows,
        drops,
        zero_filled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::dataset;

    fn minutes(values: &[f64]) -> Vec<Decimal> {
        values.iter().map(|&v| Decimal::try_from(v).unwrap()).collect()
    }

    fn clean(text: &str) -> DowntimeTable {
        clean_downtime(&dataset("line-downtime.csv", text), &PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_spurious_header_row_removed_anywhere() {
        let table = clean(
            "Batch|Factor 1|Factor 2\n\
             Batch|Factor 1|Factor 2\n\
             101|20|0\n\
             Batch|1|2\n\
             102|5|5\n",
        );
        assert_eq!(table.rows.len(), 2);
        assert!(table.rows.iter().all(|r| r.batch_id != 0));
        assert_eq!(table.drops.count(DropReason::SpuriousHeaderRow), 2);
    }

    #[test]
    fn test_non_numeric_batch_dropped() {
        let table = clean("Batch|Factor 1\nB-7|3\n101|4\n");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.drops.count(DropReason::ParseFailure), 1);
    }

    #[test]
    fn test_bad_or_missing_minutes_are_zero() {
        let table = clean("Batch|Factor 1|Factor 2|Factor 3\n101||abc|7.5\n");
        assert_eq!(table.rows[0].minutes, minutes(&[0.0, 0.0, 7.5]));
        assert_eq!(table.zero_filled, 1);
        assert_eq!(table.rows[0].total(), Decimal::new(75, 1));
    }

    #[test]
    fn test_factor_columns_in_source_order() {
        let table = clean("Factor 2|Batch|Factor 1\n1|101|2\n");
        assert_eq!(table.factor_columns, vec!["Factor 2", "Factor 1"]);
        assert_eq!(table.rows[0].minutes, minutes(&[1.0, 2.0]));
    }

    #[test]
    fn test_short_row_zero_fills() {
        let table = clean("Batch|Factor 1|Factor 2\n101|4\n");
        assert_eq!(table.rows[0].minutes, minutes(&[4.0, 0.0]));
        assert_eq!(table.zero_filled, 0);
    }
}
