//! Pure matrix operations.
//!
//! Every function takes its operands by reference and returns a fresh
//! result, so inputs are never mutated.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    command::{Command, Operation},
    matrix::{Matrix, Shape, format_number},
};

/// Determinant magnitude below which a matrix counts as singular.
pub const SINGULARITY_TOLERANCE: f64 = 1e-10;

/// Numeric engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatrixError {
    #[error("dimension mismatch ({left} vs {right})")]
    DimensionMismatch { left: Shape, right: Shape },
    #[error("matrix is not square ({shape})")]
    NotSquare { shape: Shape },
    #[error("matrix is singular")]
    Singular,
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Matrix(Matrix),
    Scalar(f64),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matrix(m) => m.fmt(f),
            Self::Scalar(v) => f.write_str(&format_number(*v)),
        }
    }
}

/// Run a parsed command.
///
/// `DET` also reports `Singular` when the determinant is numerically zero,
/// so a degenerate system is flagged the same way for both `DET` and
/// `INVERSE`.
///
/// # Errors
/// Returns the engine failure for the operation.
pub fn evaluate(command: &Command) -> Result<Outcome, MatrixError> {
    match &command.operation {
        Operation::Add(a, b) => add(a, b).map(Outcome::Matrix),
        Operation::Sub(a, b) => sub(a, b).map(Outcome::Matrix),
        Operation::Mul(a, b) => mul(a, b).map(Outcome::Matrix),
        Operation::Transpose(a) => Ok(Outcome::Matrix(transpose(a))),
        Operation::Inverse(a) => inverse(a).map(Outcome::Matrix),
        Operation::Det(a) => {
            let lu = Lu::decompose(a)?;
            if lu.is_singular() {
                Err(MatrixError::Singular)
            } else {
                Ok(Outcome::Scalar(lu.determinant()))
            }
        }
    }
}

/// Element-wise sum.
///
/// # Errors
/// Returns `DimensionMismatch` unless both shapes are identical.
pub fn add(a: &Matrix, b: &Matrix) -> Result<Matrix, MatrixError> {
    zip_with(a, b, |x, y| x + y)
}

/// Element-wise difference.
///
/// # Errors
/// Returns `DimensionMismatch` unless both shapes are identical.
pub fn sub(a: &Matrix, b: &Matrix) -> Result<Matrix, MatrixError> {
    zip_with(a, b, |x, y| x - y)
}

fn zip_with(a: &Matrix, b: &Matrix, f: impl Fn(f64, f64) -> f64) -> Result<Matrix, MatrixError> {
    if a.shape() != b.shape() {
        return Err(MatrixError::DimensionMismatch {
            left: a.shape(),
            right: b.shape(),
        });
    }
    let data = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Ok(Matrix::from_parts(a.shape(), data))
}

/// Matrix product `a * b`.
///
/// # Errors
/// Returns `DimensionMismatch` unless `a.cols() == b.rows()`.
pub fn mul(a: &Matrix, b: &Matrix) -> Result<Matrix, MatrixError> {
    if a.cols() != b.rows() {
        return Err(MatrixError::DimensionMismatch {
            left: a.shape(),
            right: b.shape(),
        });
    }
    let (n, m, p) = (a.rows(), a.cols(), b.cols());
    let (lhs, rhs) = (a.as_slice(), b.as_slice());
    let mut data = vec![0.0; n * p];
    for i in 0..n {
        for k in 0..m {
            let aik = lhs[i * m + k];
            for j in 0..p {
                data[i * p + j] += aik * rhs[k * p + j];
            }
        }
    }
    Ok(Matrix::from_parts(Shape::new(n, p), data))
}

/// Swap rows and columns.
#[must_use]
pub fn transpose(a: &Matrix) -> Matrix {
    let (rows, cols) = (a.rows(), a.cols());
    let src = a.as_slice();
    let mut data = Vec::with_capacity(src.len());
    for j in 0..cols {
        for i in 0..rows {
            data.push(src[i * cols + j]);
        }
    }
    Matrix::from_parts(Shape::new(cols, rows), data)
}

/// Determinant via LU decomposition with partial pivoting.
///
/// # Errors
/// Returns `NotSquare` for rectangular input.
pub fn determinant(a: &Matrix) -> Result<f64, MatrixError> {
    Ok(Lu::decompose(a)?.determinant())
}

/// Inverse via LU decomposition.
///
/// # Errors
/// Returns `NotSquare` for rectangular input and `Singular` when
/// `|det| < SINGULARITY_TOLERANCE`, the determinant is NaN, or the
/// result overflows.
pub fn inverse(a: &Matrix) -> Result<Matrix, MatrixError> {
    let lu = Lu::decompose(a)?;
    if lu.is_singular() {
        return Err(MatrixError::Singular);
    }

    let n = lu.n;
    let mut data = vec![0.0; n * n];
    let mut column = vec![0.0; n];
    for j in 0..n {
        lu.solve_unit(j, &mut column);
        for (i, value) in column.iter().enumerate() {
            data[i * n + j] = *value;
        }
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(MatrixError::Singular);
    }
    Ok(Matrix::from_parts(Shape::new(n, n), data))
}

/// Packed `PA = LU` factorization: unit-lower `L` below the diagonal, `U`
/// on and above it.
struct Lu {
    n: usize,
    lu: Vec<f64>,
    /// `perm[i]` is the original row now at position `i`.
    perm: Vec<usize>,
    sign: f64,
}

impl Lu {
    fn decompose(a: &Matrix) -> Result<Self, MatrixError> {
        if !a.shape().is_square() {
            return Err(MatrixError::NotSquare { shape: a.shape() });
        }
        let n = a.rows();
        let mut lu = a.as_slice().to_vec();
        let mut perm: Vec<usize> = (0..n).collect();
        let mut sign = 1.0;

        for k in 0..n {
            let pivot_row = (k..n)
                .max_by(|&x, &y| lu[x * n + k].abs().total_cmp(&lu[y * n + k].abs()))
                .unwrap_or(k);
            if pivot_row != k {
                for j in 0..n {
                    lu.swap(k * n + j, pivot_row * n + j);
                }
                perm.swap(k, pivot_row);
                sign = -sign;
            }

            let pivot = lu[k * n + k];
            // Zero column: U has a zero on the diagonal and the product of
            // pivots is already zero.
            if pivot == 0.0 {
                continue;
            }
            for i in (k + 1)..n {
                let factor = lu[i * n + k] / pivot;
                lu[i * n + k] = factor;
                for j in (k + 1)..n {
                    lu[i * n + j] -= factor * lu[k * n + j];
                }
            }
        }

        Ok(Self { n, lu, perm, sign })
    }

    fn determinant(&self) -> f64 {
        (0..self.n).fold(self.sign, |acc, i| acc * self.lu[i * self.n + i])
    }

    /// The pivot product can overflow to infinity before it meets a zero
    /// pivot, so a NaN determinant also counts as singular.
    fn is_singular(&self) -> bool {
        let det = self.determinant();
        det.is_nan() || det.abs() < SINGULARITY_TOLERANCE
    }

    /// Solve `A x = e_col` into `out`. Caller guarantees a non-zero diagonal.
    fn solve_unit(&self, col: usize, out: &mut [f64]) {
        let n = self.n;
        // Forward substitution with L (unit diagonal) on P e_col.
        for i in 0..n {
            let mut sum = if self.perm[i] == col { 1.0 } else { 0.0 };
            for k in 0..i {
                sum -= self.lu[i * n + k] * out[k];
            }
            out[i] = sum;
        }
        // Back substitution with U.
        for i in (0..n).rev() {
            let mut sum = out[i];
            for k in (i + 1)..n {
                sum -= self.lu[i * n + k] * out[k];
            }
            out[i] = sum / self.lu[i * n + i];
        }
    }
}
