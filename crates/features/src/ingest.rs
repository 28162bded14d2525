//! Raw data ingestion: CSV files or a deterministic synthetic series.

use std::f32::consts::PI;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{FEATURE_COLUMNS, FeatureError, Result, TimeSeriesTable};

/// Number of hourly rows generated when no data file is available.
pub const SYNTHETIC_SAMPLES: usize = 10_000;

/// Seed for the synthetic noise, fixed so every job sees the same series.
const SYNTHETIC_SEED: u64 = 42;

/// Where the pipeline reads raw readings from.
///
/// Falling back to synthetic data when the file is missing is the documented
/// default, not an error.
#[derive(Debug, Clone)]
pub struct DataSource {
    path: Option<PathBuf>,
    synthetic_samples: usize,
    seed: u64,
}

impl DataSource {
    /// Creates a data source reading `path` when it exists.
    #[must_use]
    pub const fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            synthetic_samples: SYNTHETIC_SAMPLES,
            seed: SYNTHETIC_SEED,
        }
    }

    /// Overrides the number of synthetic rows.
    #[must_use]
    pub const fn with_synthetic_samples(mut self, samples: usize) -> Self {
        self.synthetic_samples = samples;
        self
    }

    /// Overrides the synthetic noise seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Loads the table from the file, or generates synthetic data.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load(&self) -> Result<TimeSeriesTable> {
        match &self.path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading data from file");
                load_csv(path)
            }
            _ => {
                warn!(
                    samples = self.synthetic_samples,
                    "Data file not found or not provided, using synthetic data"
                );
                Ok(generate_synthetic(self.synthetic_samples, self.seed))
            }
        }
    }
}

/// Generates hourly energy consumption readings starting 2023-01-01.
///
/// `consumption = 50 + trend + daily + weekly + noise` where the trend rises
/// linearly from 0 to 10, the daily and weekly terms are sine waves of
/// amplitude 10 and 5, and the noise is normal with standard deviation 2.
#[must_use]
pub fn generate_synthetic(n_samples: usize, seed: u64) -> TimeSeriesTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut table = TimeSeriesTable::new(FEATURE_COLUMNS);

    let start = NaiveDate::from_ymd_opt(2023, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    let trend_step = if n_samples > 1 {
        10.0 / (n_samples - 1) as f32
    } else {
        0.0
    };

    for i in 0..n_samples {
        let timestamp = start + Duration::hours(i as i64);
        let [hour, day_of_week] = calendar_features(timestamp);

        let trend = i as f32 * trend_step;
        let daily = 10.0 * (2.0 * PI * hour / 24.0).sin();
        let weekly = 5.0 * (2.0 * PI * day_of_week / 7.0).sin();
        let noise: f32 = rng.sample::<f32, _>(StandardNormal) * 2.0;

        let consumption = 50.0 + trend + daily + weekly + noise;

        // Hourly steps from a fixed start are strictly increasing.
        let _ = table.push_row(timestamp, &[consumption, hour, day_of_week]);
    }

    table
}

#[derive(Debug, Deserialize)]
struct RawReading {
    timestamp: String,
    consumption: f32,
}

/// Loads a CSV file with at least `timestamp` and `consumption` columns.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or a row is malformed.
pub fn load_csv(path: &Path) -> Result<TimeSeriesTable> {
    let file = std::fs::File::open(path)?;
    read_csv(file)
}

/// Reads readings from any CSV source.
///
/// Calendar features (`hour`, `day_of_week` with Monday = 0) are derived from
/// the timestamp; any other columns are ignored.
///
/// # Errors
///
/// Returns an error on malformed rows, unparsable timestamps or
/// non-increasing timestamps.
pub fn read_csv<R: Read>(reader: R) -> Result<TimeSeriesTable> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut table = TimeSeriesTable::new(FEATURE_COLUMNS);

    for record in csv_reader.deserialize() {
        let reading: RawReading = record?;
        let timestamp = parse_timestamp(&reading.timestamp)?;
        let [hour, day_of_week] = calendar_features(timestamp);
        table.push_row(timestamp, &[reading.consumption, hour, day_of_week])?;
    }

    info!(rows = table.len(), "Loaded readings from CSV");
    Ok(table)
}

fn calendar_features(timestamp: NaiveDateTime) -> [f32; 2] {
    [
        timestamp.hour() as f32,
        timestamp.weekday().num_days_from_monday() as f32,
    ]
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed);
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.naive_utc());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| FeatureError::Timestamp(raw.to_string()))
}
