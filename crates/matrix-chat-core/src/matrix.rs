//! Validated matrix type and its text format.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Row and column count of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    #[must_use]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    #[must_use]
    pub const fn is_square(self) -> bool {
        self.rows == self.cols
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Reasons a grid of numbers cannot form a matrix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("matrix must have at least one row and one column")]
    Empty,
    #[error("row {row} has {found} entries, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("{shape} matrix needs {expected} entries, got {found}")]
    Length {
        shape: Shape,
        expected: usize,
        found: usize,
    },
    #[error("entries must be finite numbers")]
    NonFinite,
    #[error("{shape} matrix is too large")]
    TooLarge { shape: Shape },
}

/// Rectangular grid of `f64` entries stored row-major.
///
/// Every constructor checks that both dimensions are at least one and
/// that the entry count matches, so a `Matrix` value is always well formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct Matrix {
    shape: Shape,
    data: Vec<f64>,
}

impl Matrix {
    /// Build a matrix from row-major entries.
    ///
    /// # Errors
    /// Returns error if a dimension is zero, the entry count differs from
    /// `rows * cols`, or an entry is not finite.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, ShapeError> {
        if rows == 0 || cols == 0 {
            return Err(ShapeError::Empty);
        }
        let shape = Shape::new(rows, cols);
        let expected = rows.checked_mul(cols).ok_or(ShapeError::TooLarge { shape })?;
        if data.len() != expected {
            return Err(ShapeError::Length {
                shape,
                expected,
                found: data.len(),
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(ShapeError::NonFinite);
        }
        Ok(Self { shape, data })
    }

    /// Build a matrix from a list of rows.
    ///
    /// # Errors
    /// Returns error if there are no rows, a row is empty, or the rows
    /// differ in length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ShapeError> {
        let cols = rows.first().map_or(0, Vec::len);
        if cols == 0 {
            return Err(ShapeError::Empty);
        }
        if let Some((row, found)) = rows
            .iter()
            .map(Vec::len)
            .enumerate()
            .find(|&(_, len)| len != cols)
        {
            return Err(ShapeError::Ragged {
                row,
                expected: cols,
                found,
            });
        }
        let count = rows.len();
        Self::new(count, cols, rows.into_iter().flatten().collect())
    }

    /// The `n x n` identity matrix.
    ///
    /// # Panics
    /// Panics if `n` is zero.
    #[must_use]
    pub fn identity(n: usize) -> Self {
        assert!(n > 0, "identity matrix needs a positive size");
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self {
            shape: Shape::new(n, n),
            data,
        }
    }

    /// Internal constructor for results whose shape the engine already checked.
    pub(crate) fn from_parts(shape: Shape, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.rows * shape.cols, data.len());
        Self { shape, data }
    }

    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    #[must_use]
    pub const fn rows(&self) -> usize {
        self.shape.rows
    }

    #[must_use]
    pub const fn cols(&self) -> usize {
        self.shape.cols
    }

    /// Entry at `(row, col)`, or `None` when out of range.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows() && col < self.cols() {
            Some(self.data[row * self.cols() + col])
        } else {
            None
        }
    }

    /// Row-major entries.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Iterate over rows as slices.
    pub fn row_iter(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks(self.cols())
    }

    /// True when every entry is within `tolerance` of the matching entry in `other`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl TryFrom<Vec<Vec<f64>>> for Matrix {
    type Error = ShapeError;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        Self::from_rows(rows)
    }
}

impl From<Matrix> for Vec<Vec<f64>> {
    fn from(matrix: Matrix) -> Self {
        matrix.row_iter().map(<[f64]>::to_vec).collect()
    }
}

/// Renders as the wire format: entries separated by a space, rows by `;`.
impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.row_iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    f.write_str(" ")?;
                }
                f.write_str(&format_number(*value))?;
            }
        }
        Ok(())
    }
}

/// Format a number with at most six fractional digits.
///
/// Trailing zeros are trimmed and negative zero prints as `0`, so whole
/// numbers print without a decimal point.
#[must_use]
pub fn format_number(value: f64) -> String {
    let mut text = format!("{value:.6}");
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text.remove(0);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_builds_row_major() {
        let m = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.shape(), Shape::new(2, 2));
        assert_eq!(m.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m.get(1, 0), Some(3.0));
        assert_eq!(m.get(2, 0), None);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(
            err,
            ShapeError::Ragged {
                row: 1,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(Matrix::from_rows(vec![]), Err(ShapeError::Empty));
        assert_eq!(Matrix::from_rows(vec![vec![]]), Err(ShapeError::Empty));
        assert_eq!(Matrix::new(0, 3, vec![]), Err(ShapeError::Empty));
    }

    #[test]
    fn test_length_and_finite_checks() {
        assert!(matches!(
            Matrix::new(2, 2, vec![1.0, 2.0, 3.0]),
            Err(ShapeError::Length { expected: 4, found: 3, .. })
        ));
        assert_eq!(
            Matrix::new(1, 1, vec![f64::NAN]),
            Err(ShapeError::NonFinite)
        );
    }

    #[test]
    fn test_display_uses_wire_format() {
        let m = Matrix::from_rows(vec![vec![2.0, 3.0], vec![4.0, 5.5]]).unwrap();
        assert_eq!(m.to_string(), "2 3;4 5.5");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(-1e-9), "0");
        assert_eq!(format_number(1.999_999_999_9), "2");
        assert_eq!(format_number(100.0), "100");
    }

    #[test]
    fn test_identity() {
        let i = Matrix::identity(3);
        assert_eq!(i.to_string(), "1 0 0;0 1 0;0 0 1");
    }

    #[test]
    fn test_serde_uses_nested_rows() {
        let m = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "[[1.0,2.0],[3.0,4.0]]");

        let back: Matrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);

        assert!(serde_json::from_str::<Matrix>("[[1.0],[2.0,3.0]]").is_err());
    }
}
