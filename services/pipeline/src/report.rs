//! Read-only KPI report over persisted fact tables.
//!
//! Mirrors what the dashboard shows (headline KPIs, daily trend, Pareto of
//! downtime reasons, worst batches) for a date range, product and operator
//! filter. Never writes back to the facts.

use crate::config::OutputFormat;
use crate::error::Result;
use crate::facts::FactBatch;
use crate::reshape::DowntimeEvent;
use crate::sink::{fact_path, FACT_BATCHES, FACT_DOWNTIME_LONG};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub product: Option<String>,
    pub operator: Option<String>,
}

impl ReportFilter {
    pub fn matches(&self, batch: &FactBatch) -> bool {
        self.from.map_or(true, |d| batch.date >= d)
            && self.to.map_or(true, |d| batch.date <= d)
            && self.product.as_deref().map_or(true, |p| batch.product_code == p)
            && self.operator.as_deref().map_or(true, |o| batch.operator == o)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiSummary {
    #[serde(with = "rust_decimal::serde::float")]
    pub total_downtime_minutes: Decimal,
    pub avg_downtime_rate: Option<f64>,
    pub avg_run_ratio: Option<f64>,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_downtime_minutes: Decimal,
    pub avg_downtime_rate: Option<f64>,
    pub avg_duration_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParetoEntry {
    pub description: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub downtime_minutes: Decimal,
    pub cumulative_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactReport {
    pub filter: ReportFilter,
    pub kpis: KpiSummary,
    pub daily: Vec<DailyPoint>,
    pub pareto: Vec<ParetoEntry>,
    pub worst_batches: Vec<FactBatch>,
}

pub fn decode_rows<T: DeserializeOwned>(bytes: &[u8], format: OutputFormat) -> Result<Vec<T>> {
    match format {
        OutputFormat::Csv => {
            let mut reader = csv::Reader::from_reader(bytes);
            let rows = reader.deserialize().collect::<std::result::Result<Vec<T>, _>>()?;
            Ok(rows)
        }
        OutputFormat::Json => Ok(serde_json::from_slice(bytes)?),
    }
}

/// Load both fact datasets written by the file sink.
pub async fn load_facts(
    dir: &Path,
    format: OutputFormat,
) -> Result<(Vec<FactBatch>, Vec<DowntimeEvent>)> {
    let batches = fs::read(fact_path(dir, FACT_BATCHES, format)).await?;
    let events = fs::read(fact_path(dir, FACT_DOWNTIME_LONG, format)).await?;
    Ok((decode_rows(&batches, format)?, decode_rows(&events, format)?))
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub fn build_report(
    batches: &[FactBatch],
    events: &[DowntimeEvent],
    filter: &ReportFilter,
    top_reasons: usize,
    top_batches: usize,
) -> FactReport {
    let selected: Vec<&FactBatch> = batches.iter().filter(|b| filter.matches(b)).collect();
    let ids: HashSet<i64> = selected.iter().map(|b| b.batch_id).collect();

    let kpis = KpiSummary {
        total_downtime_minutes: selected.iter().map(|b| b.downtime_total_minutes).sum(),
        avg_downtime_rate: mean(selected.iter().filter_map(|b| b.downtime_rate)),
        avg_run_ratio: mean(selected.iter().filter_map(|b| b.run_ratio)),
        batches: ids.len(),
    };

    let mut by_day: BTreeMap<NaiveDate, Vec<&FactBatch>> = BTreeMap::new();
    for b in &selected {
        by_day.entry(b.date).or_default().push(b);
    }
    let daily = by_day
        .into_iter()
        .map(|(date, day)| DailyPoint {
            date,
            total_downtime_minutes: day.iter().map(|b| b.downtime_total_minutes).sum(),
            avg_downtime_rate: mean(day.iter().filter_map(|b| b.downtime_rate)),
            avg_duration_minutes: mean(day.iter().filter_map(|b| b.duration_minutes.to_f64()))
                .unwrap_or(0.0),
        })
        .collect();

    // Events without a description have no reason to rank.
    let mut reasons: BTreeMap<&str, Decimal> = BTreeMap::new();
    for e in events.iter().filter(|e| ids.contains(&e.batch_id)) {
        if let Some(desc) = e.factor_description.as_deref() {
            *reasons.entry(desc).or_insert(Decimal::ZERO) += e.downtime_minutes;
        }
    }
    let mut ranked: Vec<(&str, Decimal)> = reasons.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.truncate(top_reasons);
    let total: Decimal = ranked.iter().map(|(_, m)| *m).sum();
    let mut running = Decimal::ZERO;
    let pareto = ranked
        .into_iter()
        .map(|(desc, minutes)| {
            running += minutes;
            ParetoEntry {
                description: desc.to_string(),
                downtime_minutes: minutes,
                cumulative_share: running.checked_div(total).and_then(|s| s.to_f64()).unwrap_or(0.0),
            }
        })
        .collect();

    let mut worst: Vec<FactBatch> = selected.into_iter().cloned().collect();
    worst.sort_by(|a, b| {
        b.downtime_total_minutes
            .cmp(&a.downtime_total_minutes)
            .then_with(|| a.batch_id.cmp(&b.batch_id))
    });
    worst.truncate(top_batches);

    FactReport {
        filter: filter.clone(),
        kpis,
        daily,
        pareto,
        worst_batches: worst,
    }
}

fn pct(v: Option<f64>) -> String {
    v.map(|x| format!("{:.1}%", x * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for FactReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Downtime KPI Overview ===")?;
        if self.kpis.batches == 0 {
            return writeln!(f, "No batches match the selected filters.");
        }
        writeln!(f, "Total downtime (min): {:.0}", self.kpis.total_downtime_minutes)?;
        writeln!(f, "Avg downtime rate:    {}", pct(self.kpis.avg_downtime_rate))?;
        writeln!(f, "Avg run ratio:        {}", pct(self.kpis.avg_run_ratio))?;
        writeln!(f, "Batches:              {}", self.kpis.batches)?;

        writeln!(f, "\nDaily trend:")?;
        for p in &self.daily {
            writeln!(
                f,
                "  {} | downtime {:>7.1} min | rate {:>6} | avg duration {:.1} min",
                p.date,
                p.total_downtime_minutes,
                pct(p.avg_downtime_rate),
                p.avg_duration_minutes
            )?;
        }

        writeln!(f, "\nTop downtime reasons (Pareto):")?;
        if self.pareto.is_empty() {
            writeln!(f, "  (no downtime reasons for these filters)")?;
        }
        for (i, r) in self.pareto.iter().enumerate() {
            writeln!(
                f,
                "  [{:2}] {:<30} {:>8.1} min  cum {:.0}%",
                i + 1,
                r.description,
                r.downtime_minutes,
                r.cumulative_share * 100.0
            )?;
        }

        writeln!(f, "\nWorst batches (highest downtime):")?;
        for b in &self.worst_batches {
            writeln!(
                f,
                "  {} | batch {} | {} | {} | {:.0}/{:.0} min down | rate {}",
                b.date,
                b.batch_id,
                b.product_code,
                b.operator,
                b.downtime_total_minutes,
                b.duration_minutes,
                pct(b.downtime_rate)
            )?;
        }
        Ok(())
    }
}
