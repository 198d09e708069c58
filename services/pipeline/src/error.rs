//! Error taxonomy for the fact pipeline.
//!
//! Only schema-level and I/O problems live here. Row-level problems (a bad
//! timestamp, a non-numeric key) are never errors: cleaners drop the row and
//! record it in their [`DropLog`](crate::clean::DropLog).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Source file missing, unreadable, or without data rows. Fatal.
    #[error("cannot read source '{path}': {reason}")]
    SourceRead { path: PathBuf, reason: String },

    /// A required column is absent from a raw dataset header.
    #[error("dataset '{dataset}' has no column '{column}' (found: {found:?})")]
    MissingColumn {
        dataset: String,
        column: String,
        found: Vec<String>,
    },

    /// Dimension key repeats while the policy is `fail`.
    #[error("duplicate key '{key}' in '{dataset}' (rows {first_line} and {line})")]
    DuplicateKey {
        dataset: String,
        key: String,
        first_line: usize,
        line: usize,
    },

    /// Zero or several columns matched the operator-error label variants.
    #[error("AMBIGUITY: operator-error column in '{dataset}' matched {matched:?} (variants: {variants:?})")]
    AmbiguousColumn {
        dataset: String,
        variants: Vec<String>,
        matched: Vec<String>,
    },

    /// Wide downtime column without a trailing factor number.
    #[error("cannot derive factor id from downtime column '{label}'")]
    FactorLabelParse { label: String },

    /// Two wide downtime columns resolve to the same factor id.
    #[error("downtime columns '{first}' and '{second}' both map to factor {factor_id}")]
    DuplicateFactorColumn {
        factor_id: i64,
        first: String,
        second: String,
    },

    /// Duplicate productivity batch id while the batch policy is `fail`.
    #[error("batch {batch_id} appears more than once in productivity (rows {first_line} and {line})")]
    DuplicateBatch {
        batch_id: i64,
        first_line: usize,
        line: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
