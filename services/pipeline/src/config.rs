//! Pipeline configuration.
//!
//! Resolution order: built-in defaults, then the optional JSON config file,
//! then environment variables (`.env` is loaded first by `main`), then CLI
//! flags. Every field has a default so a config file only needs the keys it
//! changes.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// What to do when a key that must be unique repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first occurrence in file order, drop and count the rest.
    KeepFirst,
    /// Abort the stage with a duplicate-key error.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

/// File names of the four raw sources, relative to `raw_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceFiles {
    pub productivity: String,
    pub downtime: String,
    pub products: String,
    pub factors: String,
}

impl Default for SourceFiles {
    fn default() -> Self {
        Self {
            productivity: "line-productivity.csv".to_string(),
            downtime: "line-downtime.csv".to_string(),
            products: "products.csv".to_string(),
            factors: "downtime-factors.csv".to_string(),
        }
    }
}

/// Raw column labels, matched after whitespace trimming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub date: String,
    pub product: String,
    pub batch: String,
    pub operator: String,
    pub start_time: String,
    pub end_time: String,
    pub min_batch_time: String,
    pub factor: String,
    pub description: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            date: "Date".to_string(),
            product: "Product".to_string(),
            batch: "Batch".to_string(),
            operator: "Operator".to_string(),
            start_time: "Start Time".to_string(),
            end_time: "End Time".to_string(),
            min_batch_time: "Min batch time".to_string(),
            factor: "Factor".to_string(),
            description: "Description".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub raw_dir: PathBuf,
    pub out_dir: PathBuf,
    pub delimiter: char,
    pub sources: SourceFiles,
    pub columns: ColumnNames,
    /// Accepted formats for the date column.
    pub date_formats: Vec<String>,
    /// Accepted formats for time-of-day start/end values.
    pub time_formats: Vec<String>,
    /// Accepted formats for start/end values that carry their own date.
    pub datetime_formats: Vec<String>,
    /// Label variants identifying the operator-error column of the factor table.
    pub operator_error_labels: Vec<String>,
    pub dimension_duplicates: DuplicatePolicy,
    pub batch_duplicates: DuplicatePolicy,
    /// Longest accepted batch span. Longer rows are dropped as multi-day spans.
    pub max_span_hours: i64,
    pub output_format: OutputFormat,
    /// Sample rows kept per quality check.
    pub sample_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("./data_raw"),
            out_dir: PathBuf::from("./data_processed"),
            delimiter: '|',
            sources: SourceFiles::default(),
            columns: ColumnNames::default(),
            date_formats: vec![
                "%Y-%m-%d".to_string(),
                "%d/%m/%Y".to_string(),
                "%m/%d/%Y".to_string(),
            ],
            time_formats: vec!["%H:%M:%S".to_string(), "%H:%M".to_string()],
            datetime_formats: vec![
                "%Y-%m-%d %H:%M:%S".to_string(),
                "%Y-%m-%d %H:%M".to_string(),
                "%Y-%m-%dT%H:%M:%S".to_string(),
            ],
            operator_error_labels: vec![
                "operator error".to_string(),
                "operator_error".to_string(),
                "operatorerror".to_string(),
                "human error".to_string(),
            ],
            dimension_duplicates: DuplicatePolicy::KeepFirst,
            batch_duplicates: DuplicatePolicy::KeepFirst,
            max_span_hours: 24,
            output_format: OutputFormat::Csv,
            sample_limit: 5,
        }
    }
}

impl PipelineConfig {
    /// Load defaults, overlay the JSON file when given, then the environment.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).await.map_err(|e| {
                    PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("RAW_DIR") {
            self.raw_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("OUT_DIR") {
            self.out_dir = PathBuf::from(dir);
        }
        if let Some(c) = std::env::var("RAW_DELIMITER")
            .ok()
            .and_then(|v| v.chars().next())
        {
            self.delimiter = c;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.delimiter.is_ascii() {
            return Err(PipelineError::Config(format!(
                "delimiter must be a single ASCII character, got {:?}",
                self.delimiter
            )));
        }
        if self.max_span_hours <= 0 {
            return Err(PipelineError::Config(
                "max_span_hours must be positive".to_string(),
            ));
        }
        if self.operator_error_labels.iter().all(|l| l.trim().is_empty()) {
            return Err(PipelineError::Config(
                "operator_error_labels must list at least one label".to_string(),
            ));
        }
        if self.date_formats.is_empty() || self.time_formats.is_empty() {
            return Err(PipelineError::Config(
                "date_formats and time_formats must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    pub fn source_path(&self, file: &str) -> PathBuf {
        self.raw_dir.join(file)
    }
}
