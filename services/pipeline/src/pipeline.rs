//! Stage wiring: read, inspect, clean, reshape, build.
//!
//! [`run`] is pure over already-read sources, so it is deterministic: the
//! same raw datasets and config always produce the same fact tables.

use crate::clean::{
    clean_downtime, clean_factors, clean_productivity, clean_products, DropLog,
};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::facts::{build_facts, FactTables};
use crate::quality::{
    downtime_checks, factor_checks, inspect, product_checks, productivity_checks, QualityReport,
};
use crate::reshape::to_long;
use crate::source::{read_source, Dataset};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RawSources {
    pub productivity: Dataset,
    pub downtime: Dataset,
    pub products: Dataset,
    pub factors: Dataset,
}

impl RawSources {
    /// Read all four sources. The first unreadable one aborts the run.
    pub async fn read(config: &PipelineConfig) -> Result<Self> {
        let delimiter = config.delimiter_byte();
        let files = &config.sources;
        Ok(Self {
            productivity: read_source(&config.source_path(&files.productivity), delimiter).await?,
            downtime: read_source(&config.source_path(&files.downtime), delimiter).await?,
            products: read_source(&config.source_path(&files.products), delimiter).await?,
            factors: read_source(&config.source_path(&files.factors), delimiter).await?,
        })
    }

    fn rows_read(&self) -> BTreeMap<String, usize> {
        [
            &self.productivity,
            &self.downtime,
            &self.products,
            &self.factors,
        ]
        .iter()
        .map(|ds| (ds.name.clone(), ds.len()))
        .collect()
    }
}

/// Counts and quality flags of one run, persisted next to the facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub rows_read: BTreeMap<String, usize>,
    pub quality: Vec<QualityReport>,
    pub drops: BTreeMap<String, DropLog>,
    pub zero_filled_cells: usize,
    pub operator_error_column: String,
    pub unmatched_factors: Vec<i64>,
    pub fact_batches: usize,
    pub fact_events: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub facts: FactTables,
    pub summary: RunSummary,
}

pub fn inspect_sources(raw: &RawSources, config: &PipelineConfig) -> Result<Vec<QualityReport>> {
    Ok(vec![
        inspect(&raw.productivity, &productivity_checks(config), config)?,
        inspect(&raw.downtime, &downtime_checks(config), config)?,
        inspect(&raw.products, &product_checks(config), config)?,
        inspect(&raw.factors, &factor_checks(config), config)?,
    ])
}

pub fn run(raw: &RawSources, config: &PipelineConfig) -> Result<PipelineOutput> {
    let quality = inspect_sources(raw, config)?;
    log::info!(
        "quality: {} flag(s) across {} sources",
        quality.iter().map(QualityReport::flagged).sum::<usize>(),
        quality.len()
    );

    let productivity = clean_productivity(&raw.productivity, config)?;
    let downtime = clean_downtime(&raw.downtime, config)?;
    let products = clean_products(&raw.products, config)?;
    let factors = clean_factors(&raw.factors, config)?;

    let long = to_long(&downtime, &factors)?;
    let facts = build_facts(&productivity, &long, &products, config.batch_duplicates)?;

    let drops = BTreeMap::from([
        ("productivity".to_string(), productivity.drops.clone()),
        ("downtime".to_string(), downtime.drops.clone()),
        ("products".to_string(), products.drops.clone()),
        ("factors".to_string(), factors.drops.clone()),
        ("facts".to_string(), facts.drops.clone()),
    ]);

    let summary = RunSummary {
        rows_read: raw.rows_read(),
        quality,
        drops,
        zero_filled_cells: downtime.zero_filled,
        operator_error_column: factors.operator_error_column.clone(),
        unmatched_factors: long.unmatched_factors.iter().copied().collect(),
        fact_batches: facts.batches.len(),
        fact_events: facts.events.len(),
    };

    Ok(PipelineOutput { facts, summary })
}
