//! Row-major time-series table.

use chrono::NaiveDateTime;

use crate::{FeatureError, Result};

/// Ordered rows of named numeric columns keyed by timestamp.
///
/// Timestamps are strictly increasing and every row carries exactly one value
/// per column.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesTable {
    columns: Vec<String>,
    timestamps: Vec<NaiveDateTime>,
    values: Vec<f32>,
}

impl TimeSeriesTable {
    /// Creates an empty table with the given column names.
    #[must_use]
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Appends a row.
    ///
    /// # Errors
    ///
    /// Fails if the row width does not match the columns, a value is NaN or
    /// infinite, or the timestamp does not strictly follow the previous one.
    pub fn push_row(&mut self, timestamp: NaiveDateTime, row: &[f32]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(FeatureError::RowWidth {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }

        if let Some(index) = row.iter().position(|v| !v.is_finite()) {
            return Err(FeatureError::NonFiniteValue {
                row: self.len(),
                column: self.columns[index].clone(),
            });
        }

        if let Some(&previous) = self.timestamps.last() {
            if timestamp <= previous {
                return Err(FeatureError::NonIncreasingTimestamp {
                    previous,
                    current: timestamp,
                });
            }
        }

        self.timestamps.push(timestamp);
        self.values.extend_from_slice(row);
        Ok(())
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Column names in storage order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row timestamps.
    #[must_use]
    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    /// Position of a column, if present.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns the values of row `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let width = self.columns.len();
        self.values.get(index * width..(index + 1) * width)
    }

    /// Iterates over rows.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks(0) panics
        let width = self.columns.len().max(1);
        self.values.chunks(width)
    }

    /// Copies one column out of the table.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownColumn` if the column does not exist.
    pub fn column_values(&self, name: &str) -> Result<Vec<f32>> {
        let index = self
            .column_index(name)
            .ok_or_else(|| FeatureError::UnknownColumn(name.to_string()))?;
        Ok(self.rows().map(|row| row[index]).collect())
    }

    /// Applies `f` to every value of the column at `index`.
    pub(crate) fn map_column(&mut self, index: usize, f: impl Fn(f32) -> f32) {
        let width = self.columns.len();
        if width == 0 {
            return;
        }
        for row in self.values.chunks_mut(width) {
            row[index] = f(row[index]);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, 1)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn test_push_and_read_rows() {
        let mut table = TimeSeriesTable::new(["a", "b"]);
        table.push_row(ts(0), &[1.0, 2.0]).expect("row 0");
        table.push_row(ts(1), &[3.0, 4.0]).expect("row 1");

        assert_eq!(table.len(), 2);
        assert_eq!(table.row(1), Some(&[3.0, 4.0][..]));
        assert_eq!(table.row(2), None);
        assert_eq!(table.column_values("b").expect("column b"), vec![2.0, 4.0]);
    }

    #[test]
    fn test_rejects_non_increasing_timestamps() {
        let mut table = TimeSeriesTable::new(["a"]);
        table.push_row(ts(5), &[1.0]).expect("first row");

        let same = table.push_row(ts(5), &[2.0]);
        assert!(matches!(same, Err(FeatureError::NonIncreasingTimestamp { .. })));

        let earlier = table.push_row(ts(4), &[2.0]);
        assert!(matches!(earlier, Err(FeatureError::NonIncreasingTimestamp { .. })));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rejects_wrong_row_width() {
        let mut table = TimeSeriesTable::new(["a", "b"]);
        let result = table.push_row(ts(0), &[1.0]);
        assert!(matches!(
            result,
            Err(FeatureError::RowWidth {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_unknown_column() {
        let table = TimeSeriesTable::new(["a"]);
        assert!(matches!(
            table.column_values("missing"),
            Err(FeatureError::UnknownColumn(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_rejects_non_finite_values() {
        let mut table = TimeSeriesTable::new(["a", "b"]);
        table.push_row(ts(0), &[1.0, 2.0]).expect("row 0");

        assert!(matches!(
            table.push_row(ts(1), &[1.0, f32::NAN]),
            Err(FeatureError::NonFiniteValue { row: 1, column }) if column == "b"
        ));
        assert!(matches!(
            table.push_row(ts(1), &[f32::INFINITY, 0.0]),
            Err(FeatureError::NonFiniteValue { row: 1, column }) if column == "a"
        ));
        assert_eq!(table.len(), 1);
    }
}
