//! Feature pipeline for the energy consumption forecaster.
//!
//! This crate turns raw hourly consumption readings into ML-ready inputs:
//! ingestion (CSV file or a deterministic synthetic series), per-column
//! min-max scaling, and sliding-window sequence construction.

use chrono::NaiveDateTime;

mod ingest;
mod scaler;
mod table;
mod windower;

pub use ingest::{DataSource, SYNTHETIC_SAMPLES, generate_synthetic, load_csv, read_csv};
pub use scaler::{ColumnRange, ScalerState};
pub use table::TimeSeriesTable;
pub use windower::{SequenceSet, SequenceWindower};

/// Column holding the value being forecast.
pub const TARGET_COLUMN: &str = "consumption";

/// Columns fed to the model, in input order.
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = ["consumption", "hour", "day_of_week"];

/// Number of features per row.
pub const FEATURE_COUNT: usize = 3;

/// Default number of consecutive rows per input sequence (one day of hourly readings).
pub const DEFAULT_WINDOW_SIZE: usize = 24;

/// Errors raised while building features.
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("insufficient data: {rows} rows cannot fill a window of {window} plus one target")]
    InsufficientData { rows: usize, window: usize },

    #[error("scaler has not been fitted")]
    NotFitted,

    #[error("cannot fit a scaler on an empty table")]
    EmptyTable,

    #[error("column `{0}` is not present")]
    UnknownColumn(String),

    #[error("timestamp {current} does not strictly follow {previous}")]
    NonIncreasingTimestamp {
        previous: NaiveDateTime,
        current: NaiveDateTime,
    },

    #[error("non-finite value in column `{column}` at row {row}")]
    NonFiniteValue { row: usize, column: String },

    #[error("scaler has {ranges} fitted ranges for {columns} columns")]
    ScalerShape { columns: usize, ranges: usize },

    #[error("row has {actual} values, expected {expected}")]
    RowWidth { expected: usize, actual: usize },

    #[error("invalid timestamp `{0}`")]
    Timestamp(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FeatureError>;
