//! Fact builder: batch-level KPI rows and the matching long downtime rows.
//!
//! Inputs are already validated. This stage only joins and derives, it does
//! not re-check anything the cleaners guarantee.

use crate::clean::{DropLog, DropReason, ProductTable, ProductivityRow, ProductivityTable};
use crate::config::DuplicatePolicy;
use crate::error::{PipelineError, Result};
use crate::reshape::{DowntimeEvent, LongDowntime};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One retained batch. Field order is the persisted column order.
///
/// Minute columns are decimals, so `actual_run_minutes + downtime_total_minutes`
/// equals `duration_minutes` exactly. Rates are plain floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactBatch {
    pub batch_id: i64,
    pub date: NaiveDate,
    pub product_code: String,
    pub operator: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub duration_minutes: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub downtime_total_minutes: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub actual_run_minutes: Decimal,
    pub downtime_rate: Option<f64>,
    pub run_ratio: Option<f64>,
    pub start_datetime: NaiveDateTime,
    pub end_datetime: NaiveDateTime,
    #[serde(with = "rust_decimal::serde::float")]
    pub min_batch_time_minutes: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactTables {
    /// Sorted by batch_id.
    pub batches: Vec<FactBatch>,
    /// Sorted by (batch_id, factor_id), restricted to retained batches.
    pub events: Vec<DowntimeEvent>,
    pub drops: DropLog,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kpis {
    pub actual_run_minutes: Decimal,
    pub downtime_rate: Option<f64>,
    pub run_ratio: Option<f64>,
}

/// Derive run time and ratios. Ratios are `None` unless duration > 0.
pub fn compute_kpis(duration_minutes: Decimal, downtime_total_minutes: Decimal) -> Kpis {
    let actual_run_minutes = duration_minutes - downtime_total_minutes;
    let ratio = |part: Decimal| {
        if duration_minutes > Decimal::ZERO {
            part.checked_div(duration_minutes).and_then(|r| r.to_f64())
        } else {
            None
        }
    };
    Kpis {
        actual_run_minutes,
        downtime_rate: ratio(downtime_total_minutes),
        run_ratio: ratio(actual_run_minutes),
    }
}

/// One productivity row per batch id, in batch id order.
fn unique_batches<'a>(
    productivity: &'a ProductivityTable,
    policy: DuplicatePolicy,
    drops: &mut DropLog,
) -> Result<BTreeMap<i64, &'a ProductivityRow>> {
    let mut batches: BTreeMap<i64, &ProductivityRow> = BTreeMap::new();
    for row in &productivity.rows {
        if let Some(first) = batches.get(&row.batch_id) {
            match policy {
                DuplicatePolicy::KeepFirst => drops.record(DropReason::DuplicateBatch),
                DuplicatePolicy::Fail => {
                    return Err(PipelineError::DuplicateBatch {
                        batch_id: row.batch_id,
                        first_line: first.line,
                        line: row.line,
                    })
                }
            }
            continue;
        }
        batches.insert(row.batch_id, row);
    }
    Ok(batches)
}

pub fn build_facts(
    productivity: &ProductivityTable,
    long: &LongDowntime,
    products: &ProductTable,
    batch_policy: DuplicatePolicy,
) -> Result<FactTables> {
    let mut drops = DropLog::default();
    let batches = unique_batches(productivity, batch_policy, &mut drops)?;

    let mut totals: BTreeMap<i64, Decimal> = BTreeMap::new();
    for event in &long.events {
        *totals.entry(event.batch_id).or_insert(Decimal::ZERO) += event.downtime_minutes;
    }
    for batch_id in totals.keys() {
        if !batches.contains_key(batch_id) {
            drops.record(DropReason::OrphanDowntime);
        }
    }

    let mut facts = Vec::with_capacity(batches.len());
    let mut overrun = 0usize;
    for (&batch_id, row) in &batches {
        let Some(product) = products.get(&row.product_code) else {
            drops.record(DropReason::MissingProduct);
            continue;
        };
        // Batches without downtime rows get 0, not absence.
        let downtime = totals.get(&batch_id).copied().unwrap_or(Decimal::ZERO);
        let kpis = compute_kpis(row.duration_minutes, downtime);
        if kpis.actual_run_minutes < Decimal::ZERO {
            overrun += 1;
        }
        facts.push(FactBatch {
            batch_id,
            date: row.date,
            product_code: row.product_code.clone(),
            operator: row.operator.clone(),
            duration_minutes: row.duration_minutes,
            downtime_total_minutes: downtime,
            actual_run_minutes: kpis.actual_run_minutes,
            downtime_rate: kpis.downtime_rate,
            run_ratio: kpis.run_ratio,
            start_datetime: row.start,
            end_datetime: row.end,
            min_batch_time_minutes: product.min_batch_time_minutes,
        });
    }

    let retained: BTreeSet<i64> = facts.iter().map(|f| f.batch_id).collect();
    let events: Vec<DowntimeEvent> = long
        .events
        .iter()
        .filter(|e| retained.contains(&e.batch_id))
        .cloned()
        .collect();

    log::info!(
        "facts: {} batches, {} downtime events",
        facts.len(),
        events.len()
    );
    if overrun > 0 {
        log::warn!("facts: {} batch(es) record more downtime than duration", overrun);
    }
    drops.report("facts");

    Ok(FactTables {
        batches: facts,
        events,
        drops,
    })
}
