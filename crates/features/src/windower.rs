//! Sliding-window sequence construction.

use tracing::debug;

use crate::{
    DEFAULT_WINDOW_SIZE, FEATURE_COLUMNS, FeatureError, Result, TARGET_COLUMN, TimeSeriesTable,
};

/// Flattened `(window, target)` pairs in input order.
///
/// `windows` holds `len() * window_size * feature_count` values laid out as
/// `[sequence][step][feature]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SequenceSet {
    pub windows: Vec<f32>,
    pub targets: Vec<f32>,
    pub window_size: usize,
    pub feature_count: usize,
}

impl SequenceSet {
    /// Builds a set from already flattened windows.
    ///
    /// # Errors
    ///
    /// Fails with `RowWidth` if `windows` does not hold exactly one window per target.
    pub fn from_parts(
        windows: Vec<f32>,
        targets: Vec<f32>,
        window_size: usize,
        feature_count: usize,
    ) -> Result<Self> {
        let expected = targets.len() * window_size * feature_count;
        if windows.len() != expected {
            return Err(FeatureError::RowWidth {
                expected,
                actual: windows.len(),
            });
        }

        Ok(Self {
            windows,
            targets,
            window_size,
            feature_count,
        })
    }

    /// Number of sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if there are no sequences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Values of one window, `window_size * feature_count` long.
    #[must_use]
    pub fn window(&self, index: usize) -> Option<&[f32]> {
        let stride = self.window_size * self.feature_count;
        self.windows.get(index * stride..(index + 1) * stride)
    }

    /// Splits by position: the first `floor(len * ratio)` sequences go left.
    ///
    /// Temporal order is preserved on both sides.
    #[must_use]
    pub fn split_at_ratio(&self, ratio: f64) -> (Self, Self) {
        let split = ((self.len() as f64) * ratio.clamp(0.0, 1.0)) as usize;
        let stride = self.window_size * self.feature_count;

        let (left_windows, right_windows) = self.windows.split_at(split * stride);
        let (left_targets, right_targets) = self.targets.split_at(split);

        let part = |windows: &[f32], targets: &[f32]| Self {
            windows: windows.to_vec(),
            targets: targets.to_vec(),
            window_size: self.window_size,
            feature_count: self.feature_count,
        };

        (
            part(left_windows, left_targets),
            part(right_windows, right_targets),
        )
    }
}

/// Builds fixed-length input sequences, each paired with the next target value.
#[derive(Debug, Clone)]
pub struct SequenceWindower {
    window_size: usize,
    feature_columns: Vec<String>,
    target_column: String,
}

impl Default for SequenceWindower {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl SequenceWindower {
    /// Creates a windower over the standard feature and target columns.
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            feature_columns: FEATURE_COLUMNS.iter().map(ToString::to_string).collect(),
            target_column: TARGET_COLUMN.to_string(),
        }
    }

    /// Overrides the feature and target columns.
    #[must_use]
    pub fn with_columns<S: Into<String>>(
        mut self,
        feature_columns: impl IntoIterator<Item = S>,
        target_column: impl Into<String>,
    ) -> Self {
        self.feature_columns = feature_columns.into_iter().map(Into::into).collect();
        self.target_column = target_column.into();
        self
    }

    /// Window length.
    #[must_use]
    pub const fn window_size(&self) -> usize {
        self.window_size
    }

    /// Produces `rows - window_size` sequences: window `i` covers rows
    /// `[i, i + window_size)` and its target is the target column at row
    /// `i + window_size`.
    ///
    /// # Errors
    ///
    /// Fails with `InsufficientData` when the table has no more rows than the
    /// window (or the window is empty), and `UnknownColumn` for missing columns.
    pub fn create_sequences(&self, table: &TimeSeriesTable) -> Result<SequenceSet> {
        let rows = table.len();
        if self.window_size == 0 || rows <= self.window_size {
            return Err(FeatureError::InsufficientData {
                rows,
                window: self.window_size,
            });
        }

        let feature_indices = self
            .feature_columns
            .iter()
            .map(|column| {
                table
                    .column_index(column)
                    .ok_or_else(|| FeatureError::UnknownColumn(column.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let targets_all = table.column_values(&self.target_column)?;

        // Project once so each window is a contiguous slice.
        let projected: Vec<f32> = table
            .rows()
            .flat_map(|row| feature_indices.iter().map(move |&i| row[i]))
            .collect();

        let count = rows - self.window_size;
        let feature_count = feature_indices.len();
        let stride = self.window_size * feature_count;

        let mut windows = Vec::with_capacity(count * stride);
        for i in 0..count {
            let start = i * feature_count;
            windows.extend_from_slice(&projected[start..start + stride]);
        }
        let targets = targets_all[self.window_size..].to_vec();

        debug!(
            sequences = count,
            window_size = self.window_size,
            "Created sequences"
        );

        Ok(SequenceSet {
            windows,
            targets,
            window_size: self.window_size,
            feature_count,
        })
    }
}
