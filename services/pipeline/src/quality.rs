//! Quality inspector: read-only defect counts over raw datasets.
//!
//! Runs before cleaning and never changes its input. The report only feeds
//! logs and the run summary, cleaning does not depend on it.

use crate::clean::{parse_clock, parse_date, parse_int};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::source::{Dataset, Row};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// Key cell equals the key column's own label.
    SpuriousHeaderRow { key: String },
    NonNumericBatchId { key: String },
    /// Date, start or end does not parse under the configured formats.
    DatetimeParseFailure { date: String, start: String, end: String },
    /// End before start on the nominal date.
    CrossMidnight { date: String, start: String, end: String },
    /// Second and later occurrences of a unique key.
    DuplicateDimensionKey { key: String },
    MissingValue { columns: Vec<String> },
}

impl Check {
    pub fn name(&self) -> &'static str {
        match self {
            Check::SpuriousHeaderRow { .. } => "spurious_header_row",
            Check::NonNumericBatchId { .. } => "non_numeric_batch_id",
            Check::DatetimeParseFailure { .. } => "datetime_parse_failure",
            Check::CrossMidnight { .. } => "cross_midnight",
            Check::DuplicateDimensionKey { .. } => "duplicate_dimension_key",
            Check::MissingValue { .. } => "missing_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub line: usize,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckResult {
    pub count: usize,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub dataset: String,
    pub rows: usize,
    pub checks: BTreeMap<String, CheckResult>,
}

impl QualityReport {
    pub fn count(&self, check: &str) -> usize {
        self.checks.get(check).map(|c| c.count).unwrap_or(0)
    }

    pub fn flagged(&self) -> usize {
        self.checks.values().map(|c| c.count).sum()
    }
}

pub fn productivity_checks(config: &PipelineConfig) -> Vec<Check> {
    let c = &config.columns;
    vec![
        Check::MissingValue {
            columns: vec![
                c.date.clone(),
                c.product.clone(),
                c.batch.clone(),
                c.operator.clone(),
                c.start_time.clone(),
                c.end_time.clone(),
            ],
        },
        Check::NonNumericBatchId { key: c.batch.clone() },
        Check::DatetimeParseFailure {
            date: c.date.clone(),
            start: c.start_time.clone(),
            end: c.end_time.clone(),
        },
        Check::CrossMidnight {
            date: c.date.clone(),
            start: c.start_time.clone(),
            end: c.end_time.clone(),
        },
    ]
}

pub fn downtime_checks(config: &PipelineConfig) -> Vec<Check> {
    let key = config.columns.batch.clone();
    vec![
        Check::SpuriousHeaderRow { key: key.clone() },
        Check::NonNumericBatchId { key },
    ]
}

pub fn product_checks(config: &PipelineConfig) -> Vec<Check> {
    vec![Check::DuplicateDimensionKey {
        key: config.columns.product.clone(),
    }]
}

pub fn factor_checks(config: &PipelineConfig) -> Vec<Check> {
    vec![Check::DuplicateDimensionKey {
        key: config.columns.factor.clone(),
    }]
}

/// Run `checks` over `ds`. Fails only when a check names a missing column.
pub fn inspect(ds: &Dataset, checks: &[Check], config: &PipelineConfig) -> Result<QualityReport> {
    let mut report = QualityReport {
        dataset: ds.name.clone(),
        rows: ds.len(),
        checks: BTreeMap::new(),
    };

    for check in checks {
        let flagged = flag_rows(ds, check, config)?;
        let result = CheckResult {
            count: flagged.len(),
            samples: flagged
                .iter()
                .take(config.sample_limit)
                .map(|row| Sample {
                    line: row.line,
                    values: row.values.clone(),
                })
                .collect(),
        };
        if result.count > 0 {
            log::warn!("{}: {} row(s) flagged by {}", ds.name, result.count, check.name());
        }
        report.checks.insert(check.name().to_string(), result);
    }

    Ok(report)
}

fn flag_rows<'a>(ds: &'a Dataset, check: &Check, config: &PipelineConfig) -> Result<Vec<&'a Row>> {
    let flagged = match check {
        Check::SpuriousHeaderRow { key } => {
            let col = ds.require_column(key)?;
            let token = key.trim();
            ds.rows.iter().filter(|r| r.get(col) == token).collect()
        }
        Check::NonNumericBatchId { key } => {
            let col = ds.require_column(key)?;
            ds.rows
                .iter()
                .filter(|r| parse_int(r.get(col)).is_none())
                .collect()
        }
        Check::DatetimeParseFailure { date, start, end } => {
            let (d, s, e) = (
                ds.require_column(date)?,
                ds.require_column(start)?,
                ds.require_column(end)?,
            );
            ds.rows
                .iter()
                .filter(|r| match parse_date(r.get(d), config) {
                    Some(day) => {
                        parse_clock(day, r.get(s), config).is_none()
                            || parse_clock(day, r.get(e), config).is_none()
                    }
                    None => true,
                })
                .collect()
        }
        Check::CrossMidnight { date, start, end } => {
            let (d, s, e) = (
                ds.require_column(date)?,
                ds.require_column(start)?,
                ds.require_column(end)?,
            );
            ds.rows
                .iter()
                .filter(|r| {
                    parse_date(r.get(d), config)
                        .and_then(|day| {
                            Some((parse_clock(day, r.get(s), config)?, parse_clock(day, r.get(e), config)?))
                        })
                        .is_some_and(|(start, end)| end < start)
                })
                .collect()
        }
        Check::DuplicateDimensionKey { key } => {
            let col = ds.require_column(key)?;
            let mut seen = HashSet::new();
            ds.rows
                .iter()
                .filter(|r| !r.get(col).is_empty() && !seen.insert(r.get(col)))
                .collect()
        }
        Check::MissingValue { columns } => {
            let cols = columns
                .iter()
                .map(|c| ds.require_column(c))
                .collect::<Result<Vec<_>>>()?;
            ds.rows
                .iter()
                .filter(|r| cols.iter().any(|&c| r.get(c).is_empty()))
                .collect()
        }
    };
    Ok(flagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::source::dataset;

    #[test]
    fn test_productivity_checks() {
        let ds = dataset(
            "line-productivity.csv",
            "Date|Product|Batch|Operator|Start Time|End Time\n\
             2024-01-01|P1|101|Alice|08:00|10:00\n\
             2024-01-01|P1|102|Bob|23:30|00:15\n\
             2024-01-01|P1|x3|Bob|25:00|10:00\n\
             2024-01-01|P1|104||08:00|09:00\n",
        );
        let config = PipelineConfig::default();
        let report = inspect(&ds, &productivity_checks(&config), &config).unwrap();

        assert_eq!(report.rows, 4);
        assert_eq!(report.count("cross_midnight"), 1);
        assert_eq!(report.count("datetime_parse_failure"), 1);
        assert_eq!(report.count("non_numeric_batch_id"), 1);
        assert_eq!(report.count("missing_value"), 1);
        assert_eq!(report.checks["cross_midnight"].samples[0].line, 3);
    }

    #[test]
    fn test_downtime_checks_count_header_rows() {
        let ds = dataset(
            "line-downtime.csv",
            "Batch|Factor 1\nBatch|Factor 1\n101|3\nBatch|x\n",
        );
        let config = PipelineConfig::default();
        let report = inspect(&ds, &downtime_checks(&config), &config).unwrap();
        assert_eq!(report.count("spurious_header_row"), 2);
        assert_eq!(report.count("non_numeric_batch_id"), 2);
        assert_eq!(report.flagged(), 4);
    }

    #[test]
    fn test_duplicate_dimension_key_counts_repeats_only() {
        let ds = dataset("products.csv", "Product|Min batch time\nP1|1\nP2|2\nP1|3\nP1|4\n");
        let config = PipelineConfig::default();
        let report = inspect(&ds, &product_checks(&config), &config).unwrap();
        let result = &report.checks["duplicate_dimension_key"];
        assert_eq!(result.count, 2);
        assert_eq!(result.samples[0].line, 4);
    }

    #[test]
    fn test_samples_are_capped() {
        let body: String = (0..20).map(|_| "Batch|1\n").collect();
        let ds = dataset("line-downtime.csv", &format!("Batch|Factor 1\n{}", body));
        let config = PipelineConfig {
            sample_limit: 3,
            ..PipelineConfig::default()
        };
        let report = inspect(&ds, &downtime_checks(&config), &config).unwrap();
        assert_eq!(report.count("spurious_header_row"), 20);
        assert_eq!(report.checks["spurious_header_row"].samples.len(), 3);
    }

    #[test]
    fn test_inspect_does_not_mutate() {
        let ds = dataset("line-downtime.csv", "Batch|Factor 1\nBatch|1\n101|2\n");
        let before = ds.clone();
        let config = PipelineConfig::default();
        inspect(&ds, &downtime_checks(&config), &config).unwrap();
        assert_eq!(ds, before);
    }

    #[test]
    fn test_check_on_missing_column_fails() {
        let ds = dataset("products.csv", "Code|Min batch time\nP1|1\n");
        let config = PipelineConfig::default();
        let result = inspect(&ds, &product_checks(&config), &config);
        assert!(matches!(result, Err(PipelineError::MissingColumn { .. })));
    }
}
