//! Wide downtime table into long (batch, factor, minutes) events.

use crate::clean::{DowntimeTable, FactorTable};
use crate::error::{PipelineError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One (batch, factor) pair. Description and flag are `None` when the
/// factor id has no row in the factor dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowntimeEvent {
    pub batch_id: i64,
    pub factor_id: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub downtime_minutes: Decimal,
    pub factor_description: Option<String>,
    pub is_operator_error: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongDowntime {
    /// Sorted by (batch_id, factor_id), one event per pair.
    pub events: Vec<DowntimeEvent>,
    /// Factor ids present as columns but missing from the factor dimension.
    pub unmatched_factors: BTreeSet<i64>,
}

/// Factor id from a column label: the trailing integer ("Factor 3" -> 3).
pub fn factor_id_from_label(label: &str) -> Result<i64> {
    let trimmed = label.trim();
    let prefix = trimmed.trim_end_matches(|c: char| c.is_ascii_digit());
    trimmed[prefix.len()..]
        .parse::<i64>()
        .map_err(|_| PipelineError::FactorLabelParse {
            label: label.to_string(),
        })
}

pub fn to_long(table: &DowntimeTable, factors: &FactorTable) -> Result<LongDowntime> {
    let mut seen: BTreeMap<i64, &str> = BTreeMap::new();
    let mut factor_ids = Vec::with_capacity(table.factor_columns.len());
    for label in &table.factor_columns {
        let id = factor_id_from_label(label)?;
        if let Some(first) = seen.insert(id, label.as_str()) {
            return Err(PipelineError::DuplicateFactorColumn {
                factor_id: id,
                first: first.to_string(),
                second: label.clone(),
            });
        }
        factor_ids.push(id);
    }

    // Repeated batch rows fold into the same pairs.
    let mut minutes: BTreeMap<(i64, i64), Decimal> = BTreeMap::new();
    for row in &table.rows {
        for (&factor_id, &value) in factor_ids.iter().zip(&row.minutes) {
            *minutes.entry((row.batch_id, factor_id)).or_insert(Decimal::ZERO) += value;
        }
    }

    let unmatched_factors: BTreeSet<i64> = factor_ids
        .iter()
        .copied()
        .filter(|id| factors.get(*id).is_none())
        .collect();
    if !unmatched_factors.is_empty() {
        log::warn!(
            "reshape: factor id(s) {:?} have no description in the factor table",
            unmatched_factors
        );
    }

    let events: Vec<DowntimeEvent> = minutes
        .into_iter()
        .map(|((batch_id, factor_id), downtime_minutes)| {
            let factor = factors.get(factor_id);
            DowntimeEvent {
                batch_id,
                factor_id,
                downtime_minutes,
                factor_description: factor.map(|f| f.description.clone()),
                is_operator_error: factor.map(|f| f.is_operator_error),
            }
        })
        .collect();

    log::info!(
        "reshape: {} wide rows x {} factors -> {} events",
        table.rows.len(),
        factor_ids.len(),
        events.len()
    );

    Ok(LongDowntime {
        events,
        unmatched_factors,
    })
}
