//! Fact persistence.
//!
//! Sinks are only called once every stage has succeeded, so a fatal error
//! never leaves a partial fact table behind. The file sink stages all files
//! as `.tmp`, renames them only after every write succeeded, and puts the
//! previous outputs back if a rename fails.

use crate::config::OutputFormat;
use crate::error::{PipelineError, Result};
use crate::facts::{FactBatch, FactTables};
use crate::pipeline::RunSummary;
use crate::reshape::DowntimeEvent;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

pub const FACT_BATCHES: &str = "fact_batches";
pub const FACT_DOWNTIME_LONG: &str = "fact_downtime_long";
pub const RUN_SUMMARY: &str = "run_summary.json";

pub trait FactSink {
    fn describe(&self) -> String;

    async fn persist(&self, facts: &FactTables, summary: &RunSummary) -> Result<()>;
}

/// A persisted fact row. `COLUMNS` matches the serde field order and is
/// written as the CSV header even when there are no rows.
pub trait FactRow: Serialize {
    const COLUMNS: &'static [&'static str];
}

impl FactRow for FactBatch {
    const COLUMNS: &'static [&'static str] = &[
        "batch_id",
        "date",
        "product_code",
        "operator",
        "duration_minutes",
        "downtime_total_minutes",
        "actual_run_minutes",
        "downtime_rate",
        "run_ratio",
        "start_datetime",
        "end_datetime",
        "min_batch_time_minutes",
    ];
}

impl FactRow for DowntimeEvent {
    const COLUMNS: &'static [&'static str] = &[
        "batch_id",
        "factor_id",
        "downtime_minutes",
        "factor_description",
        "is_operator_error",
    ];
}

/// Path of a fact dataset inside `dir` for the given format.
pub fn fact_path(dir: &Path, name: &str, format: OutputFormat) -> PathBuf {
    dir.join(format!("{}.{}", name, format.extension()))
}

pub fn encode_rows<T: FactRow>(rows: &[T], format: OutputFormat) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            if rows.is_empty() {
                writer.write_record(T::COLUMNS)?;
            }
            for row in rows {
                writer.serialize(row)?;
            }
            writer
                .into_inner()
                .map_err(|e| PipelineError::Io(e.into_error()))
        }
        OutputFormat::Json => Ok(serde_json::to_vec_pretty(rows)?),
    }
}

// =============================================================================
// FILE SINK
// =============================================================================

/// `name.csv` -> `name.csv.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

async fn discard<'a>(paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}

async fn replace(tmp: &Path, path: &Path, backup: &Path, parked: bool) -> std::io::Result<()> {
    if parked {
        fs::rename(path, backup).await?;
    }
    if let Err(e) = fs::rename(tmp, path).await {
        if parked {
            let _ = fs::rename(backup, path).await;
        }
        return Err(e);
    }
    Ok(())
}

/// Move every staged file over its target. Existing targets are parked as
/// `.bak` first, so a failed rename restores the previous set of outputs.
async fn swap_in(staged: &[(PathBuf, PathBuf)]) -> Result<()> {
    let mut committed: Vec<(&PathBuf, Option<PathBuf>)> = Vec::with_capacity(staged.len());

    for (idx, (tmp, path)) in staged.iter().enumerate() {
        let backup = sibling(path, "bak");
        let parked = fs::try_exists(path).await.unwrap_or(false);

        let step = replace(tmp, path, &backup, parked).await;

        if let Err(e) = step {
            for (path, backup) in committed.iter().rev() {
                match backup {
                    Some(backup) => {
                        let _ = fs::rename(backup, path).await;
                    }
                    None => {
                        let _ = fs::remove_file(path).await;
                    }
                }
            }
            discard(staged[idx..].iter().map(|(tmp, _)| tmp)).await;
            log::warn!("file sink: rolled back after failing on {}", path.display());
            return Err(e.into());
        }
        committed.push((path, parked.then_some(backup)));
    }

    for (_, backup) in &committed {
        if let Some(backup) = backup {
            let _ = fs::remove_file(backup).await;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileSink {
    pub dir: PathBuf,
    pub format: OutputFormat,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }
}

impl FactSink for FileSink {
    fn describe(&self) -> String {
        format!("{} ({})", self.dir.display(), self.format.extension())
    }

    async fn persist(&self, facts: &FactTables, summary: &RunSummary) -> Result<()> {
        // fact_batches goes last: readers open it first.
        let files = vec![
            (self.dir.join(RUN_SUMMARY), serde_json::to_vec_pretty(summary)?),
            (
                fact_path(&self.dir, FACT_DOWNTIME_LONG, self.format),
                encode_rows(&facts.events, self.format)?,
            ),
            (
                fact_path(&self.dir, FACT_BATCHES, self.format),
                encode_rows(&facts.batches, self.format)?,
            ),
        ];

        fs::create_dir_all(&self.dir).await?;

        let mut staged = Vec::with_capacity(files.len());
        for (path, bytes) in &files {
            let tmp = sibling(path, "tmp");
            if let Err(e) = fs::write(&tmp, bytes).await {
                discard(staged.iter().map(|(tmp, _)| tmp)).await;
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            staged.push((tmp, path.clone()));
        }
        swap_in(&staged).await?;

        log::info!(
            "wrote {} batches and {} events to {}",
            facts.batches.len(),
            facts.events.len(),
            self.dir.display()
        );
        Ok(())
    }
}

// =============================================================================
// POSTGRES SINK
// =============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS fact_batches (
        batch_id BIGINT PRIMARY KEY,
        date DATE NOT NULL,
        product_code TEXT NOT NULL,
        operator TEXT NOT NULL,
        duration_minutes NUMERIC NOT NULL,
        downtime_total_minutes NUMERIC NOT NULL,
        actual_run_minutes NUMERIC NOT NULL,
        downtime_rate DOUBLE PRECISION,
        run_ratio DOUBLE PRECISION,
        start_datetime TIMESTAMP NOT NULL,
        end_datetime TIMESTAMP NOT NULL,
        min_batch_time_minutes NUMERIC NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fact_downtime_long (
        batch_id BIGINT NOT NULL REFERENCES fact_batches (batch_id) ON DELETE CASCADE,
        factor_id BIGINT NOT NULL,
        downtime_minutes NUMERIC NOT NULL,
        factor_description TEXT,
        is_operator_error BOOLEAN,
        PRIMARY KEY (batch_id, factor_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        run_id UUID PRIMARY KEY,
        finished_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        status TEXT NOT NULL,
        error TEXT,
        detail JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
];

/// Replaces both fact tables in one transaction and logs the run.
pub struct PgSink {
    pool: PgPool,
    run_id: Uuid,
}

impl PgSink {
    pub async fn connect(db_url: &str, run_id: Uuid) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(db_url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, run_id })
    }

    /// Record a run that failed before anything was persisted.
    pub async fn record_failure(&self, error: &str) -> Result<()> {
        sqlx::query("INSERT INTO pipeline_runs (run_id, status, error) VALUES ($1, 'failed', $2)")
            .bind(self.run_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl FactSink for PgSink {
    fn describe(&self) -> String {
        format!("postgres (run {})", self.run_id)
    }

    async fn persist(&self, facts: &FactTables, summary: &RunSummary) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fact_downtime_long")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fact_batches")
            .execute(&mut *tx)
            .await?;

        for b in &facts.batches {
            sqlx::query(
                r#"
                INSERT INTO fact_batches (
                    batch_id, date, product_code, operator, duration_minutes,
                    downtime_total_minutes, actual_run_minutes, downtime_rate, run_ratio,
                    start_datetime, end_datetime, min_batch_time_minutes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(b.batch_id)
            .bind(b.date)
            .bind(&b.product_code)
            .bind(&b.operator)
            .bind(b.duration_minutes)
            .bind(b.downtime_total_minutes)
            .bind(b.actual_run_minutes)
            .bind(b.downtime_rate)
            .bind(b.run_ratio)
            .bind(b.start_datetime)
            .bind(b.end_datetime)
            .bind(b.min_batch_time_minutes)
            .execute(&mut *tx)
            .await?;
        }

        for e in &facts.events {
            sqlx::query(
                r#"
                INSERT INTO fact_downtime_long (
                    batch_id, factor_id, downtime_minutes, factor_description, is_operator_error
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(e.batch_id)
            .bind(e.factor_id)
            .bind(e.downtime_minutes)
            .bind(&e.factor_description)
            .bind(e.is_operator_error)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT INTO pipeline_runs (run_id, status, detail) VALUES ($1, 'ok', $2)")
            .bind(self.run_id)
            .bind(serde_json::to_value(summary)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        log::info!(
            "postgres: replaced facts ({} batches, {} events), run {}",
            facts.batches.len(),
            facts.events.len(),
            self.run_id
        );
        Ok(())
    }
}
