use ndarray::Array2;
use ndarray_linalg::Inverse;

use crate::error::{Result, SemError};
use crate::linalg::{from_array2, norm1};
use crate::model::{ModelMatrices, SemModel};
use crate::types::Matrix;

/// Reciprocal-condition-number floor below which (I - B) is treated as
/// singular.
const RCOND_TOL: f64 = 1e-12;

/// Model-implied covariance of the observed variables,
/// Sigma = Lambda (I - B)^-1 Psi (I - B)^-T Lambda^T + Theta,
/// as a pure function of the structural matrices.
pub fn sigma_of(mats: &ModelMatrices) -> Result<Array2<f64>> {
    let m = mats.beta.nrows();
    if m == 0 {
        // No latent variables: Sigma reduces to the residual covariance.
        return Ok(mats.theta.clone());
    }
    let i_b = Array2::eye(m) - &mats.beta;
    let inv = i_b
        .inv()
        .map_err(|_| SemError::SingularStructuralMatrix { rcond: 0.0 })?;
    let rcond = 1.0 / (norm1(&i_b) * norm1(&inv));
    if !rcond.is_finite() || rcond < RCOND_TOL {
        return Err(SemError::SingularStructuralMatrix { rcond });
    }
    let total = inv.dot(&mats.psi).dot(&inv.t());
    let mut sigma = mats.lambda.dot(&total).dot(&mats.lambda.t()) + &mats.theta;
    // Symmetrize away floating-point drift from the triple product.
    let p = sigma.nrows();
    for i in 0..p {
        for j in 0..i {
            let avg = 0.5 * (sigma[(i, j)] + sigma[(j, i)]);
            sigma[(i, j)] = avg;
            sigma[(j, i)] = avg;
        }
    }
    Ok(sigma)
}

/// Sigma(theta) for a model, rebuilding the structural matrices from the
/// candidate parameter vector. Reentrant; no hidden state.
pub(crate) fn sigma_at(model: &SemModel, theta: &[f64]) -> Result<Array2<f64>> {
    sigma_of(&model.build_matrices(theta))
}

/// Public row-major variant of [`sigma_at`] for callers outside the crate.
pub fn implied_covariance(model: &SemModel, theta: &[f64]) -> Result<Matrix> {
    Ok(from_array2(&sigma_at(model, theta)?))
}
