//! Product and downtime-factor dimension cleaners.
//!
//! Both tables are keyed lookups for the fact joins, so key uniqueness is
//! enforced here under the configured [`DuplicatePolicy`].

use super::{parse_flag, parse_int, parse_minutes, DropLog, DropReason};
use crate::config::{DuplicatePolicy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::source::Dataset;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub line: usize,
    pub product_code: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub min_batch_time_minutes: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductTable {
    pub products: BTreeMap<String, Product>,
    pub drops: DropLog,
}

impl ProductTable {
    pub fn get(&self, code: &str) -> Option<&Product> {
        self.products.get(code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Factor {
    pub line: usize,
    pub factor_id: i64,
    pub description: String,
    pub is_operator_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorTable {
    pub factors: BTreeMap<i64, Factor>,
    /// Raw label of the column resolved as the operator-error flag.
    pub operator_error_column: String,
    pub drops: DropLog,
}

impl FactorTable {
    pub fn get(&self, factor_id: i64) -> Option<&Factor> {
        self.factors.get(&factor_id)
    }
}

/// Insert under the duplicate policy. `Ok(false)` means the row was dropped.
fn insert_unique<K: Ord + ToString, V>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    line: usize,
    first_line: impl Fn(&V) -> usize,
    policy: DuplicatePolicy,
    dataset: &str,
) -> Result<bool> {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(true)
        }
        Entry::Occupied(existing) => match policy {
            DuplicatePolicy::KeepFirst => Ok(false),
            DuplicatePolicy::Fail => Err(PipelineError::DuplicateKey {
                dataset: dataset.to_string(),
                key: existing.key().to_string(),
                first_line: first_line(existing.get()),
                line,
            }),
        },
    }
}

pub fn clean_products(ds: &Dataset, config: &PipelineConfig) -> Result<ProductTable> {
    let code_col = ds.require_column(&config.columns.product)?;
    let min_col = ds.require_column(&config.columns.min_batch_time)?;

    let mut products = BTreeMap::new();
    let mut drops = DropLog::default();

    for row in &ds.rows {
        let code = row.get(code_col);
        if code.is_empty() {
            drops.record(DropReason::MissingValue);
            continue;
        }
        let Some(min_batch_time) = parse_minutes(row.get(min_col)) else {
            drops.record(DropReason::ParseFailure);
            continue;
        };
        let product = Product {
            line: row.line,
            product_code: code.to_string(),
            min_batch_time_minutes: min_batch_time,
        };
        let kept = insert_unique(
            &mut products,
            code.to_string(),
            product,
            row.line,
            |p| p.line,
            config.dimension_duplicates,
            &ds.name,
        )?;
        if !kept {
            drops.record(DropReason::DuplicateKey);
        }
    }

    log::info!("products: {} unique of {} rows", products.len(), ds.len());
    drops.report("products");

    Ok(ProductTable { products, drops })
}

/// Find the single column whose label contains one of `variants`
/// (case-insensitive).
pub fn resolve_operator_error_column(ds: &Dataset, variants: &[String]) -> Result<usize> {
    let variants: Vec<String> = variants
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let matched: Vec<usize> = ds
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| {
            let label = h.to_lowercase();
            variants.iter().any(|v| label.contains(v.as_str()))
        })
        .map(|(i, _)| i)
        .collect();

    match matched.as_slice() {
        [only] => Ok(*only),
        _ => Err(PipelineError::AmbiguousColumn {
            dataset: ds.name.clone(),
            variants,
            matched: matched.iter().map(|&i| ds.headers[i].clone()).collect(),
        }),
    }
}

pub fn clean_factors(ds: &Dataset, config: &PipelineConfig) -> Result<FactorTable> {
    let id_col = ds.require_column(&config.columns.factor)?;
    let desc_col = ds.require_column(&config.columns.description)?;
    let flag_col = resolve_operator_error_column(ds, &config.operator_error_labels)?;
    let operator_error_column = ds.headers[flag_col].clone();
    log::info!("factors: operator-error flag read from '{}'", operator_error_column);

    let mut factors = BTreeMap::new();
    let mut drops = DropLog::default();

    for row in &ds.rows {
        let (Some(factor_id), Some(is_operator_error)) =
            (parse_int(row.get(id_col)), parse_flag(row.get(flag_col)))
        else {
            drops.record(DropReason::ParseFailure);
            continue;
        };
        // Empty descriptions read back as unmapped factors.
        let description = row.get(desc_col);
        if description.is_empty() {
            drops.record(DropReason::MissingValue);
            continue;
        }
        let factor = Factor {
            line: row.line,
            factor_id,
            description: description.to_string(),
            is_operator_error,
        };
        let kept = insert_unique(
            &mut factors,
            factor_id,
            factor,
            row.line,
            |f| f.line,
            config.dimension_duplicates,
            &ds.name,
        )?;
        if !kept {
            drops.record(DropReason::DuplicateKey);
        }
    }

    log::info!("factors: {} unique of {} rows", factors.len(), ds.len());
    drops.report("factors");

    Ok(FactorTable {
        factors,
        operator_error_column,
        drops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::dataset;

    fn fail_on_duplicates() -> PipelineConfig {
        PipelineConfig {
            dimension_duplicates: DuplicatePolicy::Fail,
            ..PipelineConfig::default()
        }
    }

    // -------------------------------------------------------------------------
    // PRODUCTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_products_drop_non_numeric_min_time() {
        let ds = dataset("products.csv", "Product|Min batch time\nP1|100\nP2|n/a\nP3|\n");
        let table = clean_products(&ds, &PipelineConfig::default()).unwrap();
        assert_eq!(table.products.len(), 1);
        assert_eq!(table.get("P1").unwrap().min_batch_time_minutes, Decimal::from(100));
        assert_eq!(table.drops.count(DropReason::ParseFailure), 2);
    }

    #[test]
    fn test_products_keep_first_duplicate() {
        let ds = dataset("products.csv", "Product|Min batch time\nP1|100\nP1|90\n");
        let table = clean_products(&ds, &PipelineConfig::default()).unwrap();
        assert_eq!(table.products.len(), 1);
        assert_eq!(table.get("P1").unwrap().min_batch_time_minutes, Decimal::from(100));
        assert_eq!(table.drops.count(DropReason::DuplicateKey), 1);
    }

    #[test]
    fn test_products_fail_policy() {
        let ds = dataset("products.csv", "Product|Min batch time\nP1|100\nP2|60\nP1|90\n");
        match clean_products(&ds, &fail_on_duplicates()) {
            Err(PipelineError::DuplicateKey {
                key,
                first_line,
                line,
                ..
            }) => {
                assert_eq!(key, "P1");
                assert_eq!(first_line, 2);
                assert_eq!(line, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    // -------------------------------------------------------------------------
    // FACTORS
    // -------------------------------------------------------------------------

    #[test]
    fn test_factors_resolve_flag_column() {
        let ds = dataset(
            "downtime-factors.csv",
            "Factor|Description|Operator Error\n1|Jam|Yes\n2|Idle|No\n",
        );
        let table = clean_factors(&ds, &PipelineConfig::default()).unwrap();
        assert_eq!(table.operator_error_column, "Operator Error");
        assert!(table.get(1).unwrap().is_operator_error);
        assert!(!table.get(2).unwrap().is_operator_error);
        assert_eq!(table.get(2).unwrap().description, "Idle");
    }

    #[test]
    fn test_factors_flag_label_variants() {
        for label in ["is_operator_error", "OPERATOR ERROR?", "Human error (Y/N)"] {
            let text = format!("Factor|Description|{}\n1|Jam|Y\n", label);
            let ds = dataset("downtime-factors.csv", &text);
            let table = clean_factors(&ds, &PipelineConfig::default()).unwrap();
            assert_eq!(table.operator_error_column, label);
        }
    }

    #[test]
    fn test_factors_no_flag_column_is_ambiguous() {
        let ds = dataset("downtime-factors.csv", "Factor|Description\n1|Jam\n");
        let result = clean_factors(&ds, &PipelineConfig::default());
        assert!(matches!(
            result,
            Err(PipelineError::AmbiguousColumn { ref matched, .. }) if matched.is_empty()
        ));
    }

    #[test]
    fn test_factors_two_flag_columns_is_ambiguous() {
        let ds = dataset(
            "downtime-factors.csv",
            "Factor|Description|Operator Error|Human Error\n1|Jam|Yes|No\n",
        );
        match clean_factors(&ds, &PipelineConfig::default()) {
            Err(PipelineError::AmbiguousColumn { matched, .. }) => {
                assert_eq!(matched, vec!["Operator Error", "Human Error"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_factors_bad_rows_dropped() {
        let ds = dataset(
            "downtime-factors.csv",
            "Factor|Description|Operator Error\nx|Jam|Yes\n2|Idle|perhaps\n3|Setup|No\n",
        );
        let table = clean_factors(&ds, &PipelineConfig::default()).unwrap();
        assert_eq!(table.factors.len(), 1);
        assert_eq!(table.drops.count(DropReason::ParseFailure), 2);
    }

    #[test]
    fn test_factors_without_description_dropped() {
        let ds = dataset(
            "downtime-factors.csv",
            "Factor|Description|Operator Error\n1||Yes\n2|Idle|No\n",
        );
        let table = clean_factors(&ds, &PipelineConfig::default()).unwrap();
        assert!(table.get(1).is_none());
        assert_eq!(table.get(2).unwrap().description, "Idle");
        assert_eq!(table.drops.count(DropReason::MissingValue), 1);
    }

    #[test]
    fn test_factors_duplicate_policy() {
        let text = "Factor|Description|Operator Error\n1|Jam|Yes\n1|Jam again|No\n";
        let ds = dataset("downtime-factors.csv", text);

        let kept = clean_factors(&ds, &PipelineConfig::default()).unwrap();
        assert_eq!(kept.get(1).unwrap().description, "Jam");
        assert_eq!(kept.drops.count(DropReason::DuplicateKey), 1);

        let failed = clean_factors(&ds, &fail_on_duplicates());
        assert!(matches!(failed, Err(PipelineError::DuplicateKey { .. })));
    }
}
