use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};

use crate::error::{Result, SemError};
use crate::types::Matrix;

pub(crate) fn to_array2(matrix: &Matrix) -> Result<Array2<f64>> {
    let n = matrix.len();
    let m = matrix.first().map(|row| row.len()).unwrap_or(0);
    let mut data = Vec::with_capacity(n * m);
    for row in matrix {
        if row.len() != m {
            return Err(SemError::Linalg("matrix is not rectangular".to_string()));
        }
        data.extend_from_slice(row);
    }
    Array2::from_shape_vec((n, m), data).map_err(|e| SemError::Linalg(e.to_string()))
}

pub(crate) fn from_array2(matrix: &Array2<f64>) -> Matrix {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Reconstruct the inverse from an eigendecomposition, zeroing reciprocals of
/// eigenvalues at or below `threshold` (a pseudo-inverse when given one).
pub(crate) fn inverse_from_eigh(
    eigvals: &Array1<f64>,
    eigvecs: &Array2<f64>,
    threshold: Option<f64>,
) -> Array2<f64> {
    let inv_vals: Vec<f64> = eigvals
        .iter()
        .map(|&v| match threshold {
            Some(t) if v <= t => 0.0,
            _ => 1.0 / v,
        })
        .collect();
    let inv_diag = Array2::from_diag(&Array1::from_vec(inv_vals));
    eigvecs.dot(&inv_diag).dot(&eigvecs.t())
}

pub(crate) fn eigh_sym(matrix: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    matrix
        .eigh(UPLO::Lower)
        .map_err(|e| SemError::Linalg(e.to_string()))
}

/// Log-determinant of a symmetric positive-definite matrix; NaN when the
/// matrix is not positive definite or the decomposition fails.
pub(crate) fn logdet_sym(matrix: &Array2<f64>) -> f64 {
    match matrix.eigh(UPLO::Lower) {
        Ok((eigvals, _)) => {
            let mut sum = 0.0;
            for v in eigvals.iter() {
                if *v <= 0.0 || !v.is_finite() {
                    return f64::NAN;
                }
                sum += v.ln();
            }
            sum
        }
        Err(_) => f64::NAN,
    }
}

/// Inverse of a symmetric positive-definite matrix via eigendecomposition;
/// None when not positive definite.
pub(crate) fn inverse_spd(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let (eigvals, eigvecs) = matrix.eigh(UPLO::Lower).ok()?;
    if eigvals.iter().any(|v| *v <= 0.0 || !v.is_finite()) {
        return None;
    }
    Some(inverse_from_eigh(&eigvals, &eigvecs, None))
}

/// Maximum absolute column sum (the induced 1-norm).
pub(crate) fn norm1(matrix: &Array2<f64>) -> f64 {
    let (n, m) = matrix.dim();
    let mut max = 0.0_f64;
    for j in 0..m {
        let mut sum = 0.0;
        for i in 0..n {
            sum += matrix[(i, j)].abs();
        }
        max = max.max(sum);
    }
    max
}

/// Half-vectorization of the lower triangle, column-major, diagonal included.
pub(crate) fn vech(matrix: &Array2<f64>) -> Vec<f64> {
    let n = matrix.nrows();
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for j in 0..n {
        for i in j..n {
            out.push(matrix[(i, j)]);
        }
    }
    out
}

/// Rescale a covariance matrix to correlation metric. Variables with
/// non-positive variance get zero rows and columns.
pub(crate) fn cov2cor(matrix: &Array2<f64>) -> Array2<f64> {
    let n = matrix.nrows();
    let sd: Vec<f64> = (0..n)
        .map(|i| {
            let v = matrix[(i, i)];
            if v > 0.0 { v.sqrt() } else { 0.0 }
        })
        .collect();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            let denom = sd[i] * sd[j];
            if denom != 0.0 {
                out[(i, j)] = matrix[(i, j)] / denom;
            }
        }
    }
    out
}
