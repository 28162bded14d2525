//! Per-column min-max scaling with persistable state.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{FeatureError, Result, TimeSeriesTable};

/// Observed range of one column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnRange {
    pub min: f32,
    pub max: f32,
}

impl ColumnRange {
    fn scale(self, value: f32) -> f32 {
        let range = self.max - self.min;
        if range == 0.0 {
            value - self.min
        } else {
            (value - self.min) / range
        }
    }

    fn unscale(self, value: f32) -> f32 {
        let range = self.max - self.min;
        if range == 0.0 {
            value + self.min
        } else {
            value.mul_add(range, self.min)
        }
    }
}

/// Min-max scaler over a fixed set of columns.
///
/// Values outside the fitted range are not clamped, so unseen data may scale
/// outside `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    columns: Vec<String>,
    ranges: Option<Vec<ColumnRange>>,
}

impl ScalerState {
    /// Creates an unfitted scaler for the given columns.
    #[must_use]
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ranges: None,
        }
    }

    /// Configured columns.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Fitted ranges in column order, if fitted.
    #[must_use]
    pub fn ranges(&self) -> Option<&[ColumnRange]> {
        self.ranges.as_deref()
    }

    /// Returns true once `fit` has succeeded.
    #[must_use]
    pub const fn is_fitted(&self) -> bool {
        self.ranges.is_some()
    }

    /// Computes the min and max of every configured column.
    ///
    /// # Errors
    ///
    /// Fails if the table is empty or lacks a configured column.
    pub fn fit(&mut self, table: &TimeSeriesTable) -> Result<()> {
        if table.is_empty() {
            return Err(FeatureError::EmptyTable);
        }

        let mut ranges = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let values = table.column_values(column)?;
            let (min, max) = values
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            ranges.push(ColumnRange { min, max });
        }

        self.ranges = Some(ranges);
        Ok(())
    }

    /// Rescales every configured column using the fitted ranges.
    ///
    /// # Errors
    ///
    /// Fails with `NotFitted` before `fit`, or `UnknownColumn` if the table
    /// lacks a configured column.
    pub fn transform(&self, table: &TimeSeriesTable) -> Result<TimeSeriesTable> {
        let ranges = self.fitted_ranges()?;

        let mut scaled = table.clone();
        for (column, range) in self.columns.iter().zip(ranges) {
            let index = table
                .column_index(column)
                .ok_or_else(|| FeatureError::UnknownColumn(column.clone()))?;
            let range = *range;
            scaled.map_column(index, |v| range.scale(v));
        }

        Ok(scaled)
    }

    /// Fits on `table` and returns it transformed.
    ///
    /// # Errors
    ///
    /// See [`ScalerState::fit`].
    pub fn fit_transform(&mut self, table: &TimeSeriesTable) -> Result<TimeSeriesTable> {
        self.fit(table)?;
        self.transform(table)
    }

    /// Scales one raw row given in configured-column order.
    ///
    /// # Errors
    ///
    /// Fails with `NotFitted` before `fit` or `RowWidth` on a width mismatch.
    pub fn transform_row(&self, row: &[f32]) -> Result<Vec<f32>> {
        let ranges = self.fitted_ranges()?;
        if row.len() != ranges.len() {
            return Err(FeatureError::RowWidth {
                expected: ranges.len(),
                actual: row.len(),
            });
        }

        Ok(row
            .iter()
            .zip(ranges)
            .map(|(&v, range)| range.scale(v))
            .collect())
    }

    /// Maps a scaled value of `column` back to raw units.
    ///
    /// # Errors
    ///
    /// Fails with `NotFitted` before `fit` or `UnknownColumn`.
    pub fn inverse_transform_value(&self, column: &str, value: f32) -> Result<f32> {
        let ranges = self.fitted_ranges()?;
        let range = self
            .columns
            .iter()
            .position(|c| c == column)
            .and_then(|index| ranges.get(index))
            .ok_or_else(|| FeatureError::UnknownColumn(column.to_string()))?;

        Ok(range.unscale(value))
    }

    /// Writes the scaler as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Saving scaler");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads a scaler previously written by [`ScalerState::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Loading scaler");
        Self::from_json(&std::fs::read(path)?)
    }

    /// Decodes a scaler from JSON, rejecting states whose fitted ranges do
    /// not line up with the columns.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or `ScalerShape` on a
    /// length mismatch.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let scaler: Self = serde_json::from_slice(json)?;
        if let Some(ranges) = &scaler.ranges {
            if ranges.len() != scaler.columns.len() {
                return Err(FeatureError::ScalerShape {
                    columns: scaler.columns.len(),
                    ranges: ranges.len(),
                });
            }
        }
        Ok(scaler)
    }

    fn fitted_ranges(&self) -> Result<&[ColumnRange]> {
        let ranges = self.ranges.as_deref().ok_or(FeatureError::NotFitted)?;
        if ranges.len() != self.columns.len() {
            return Err(FeatureError::ScalerShape {
                columns: self.columns.len(),
                ranges: ranges.len(),
            });
        }
        Ok(ranges)
    }
}
