use ndarray::Array2;
use tracing::debug;

use crate::error::{Result, SemError};
use crate::fit::ml_discrepancy;
use crate::implied::sigma_at;
use crate::linalg::{eigh_sym, inverse_from_eigh, inverse_spd};
use crate::model::SemModel;
use crate::types::{FitWarning, Information};

/// Relative eigenvalue floor below which the information matrix is treated
/// as singular.
const SINGULAR_RTOL: f64 = 1e-10;

pub(crate) struct Inference {
    pub vcov: Array2<f64>,
    pub se: Vec<f64>,
    pub warning: Option<FitWarning>,
}

impl Inference {
    /// All standard errors undefined; used when inference cannot be computed
    /// at all. Non-fatal by design: estimates remain reportable.
    pub(crate) fn undefined(model: &SemModel) -> Self {
        let q = model.free.len();
        Inference {
            vcov: Array2::from_elem((q, q), f64::NAN),
            se: vec![f64::NAN; q],
            warning: Some(FitWarning::SingularInformation {
                params: model.free_param_names(),
            }),
        }
    }
}

/// Central-difference derivative matrices dSigma/dtheta_i at theta.
fn sigma_derivatives(model: &SemModel, theta: &[f64]) -> Result<Vec<Array2<f64>>> {
    let q = theta.len();
    let mut derivs = Vec::with_capacity(q);
    let mut work = theta.to_vec();
    for i in 0..q {
        let eps = 1e-6 * theta[i].abs().max(1.0);
        work[i] = theta[i] + eps;
        let plus = sigma_at(model, &work)?;
        work[i] = theta[i] - eps;
        let minus = sigma_at(model, &work)?;
        work[i] = theta[i];
        derivs.push((plus - minus) / (2.0 * eps));
    }
    Ok(derivs)
}

/// Expected unit information,
/// I[i,j] = 1/2 tr(Sigma^-1 dSigma_i Sigma^-1 dSigma_j).
fn expected_information_unit(model: &SemModel, theta: &[f64]) -> Result<Array2<f64>> {
    let sigma = sigma_at(model, theta)?;
    let sigma_inv = inverse_spd(&sigma).ok_or_else(|| {
        SemError::Linalg("implied covariance not positive definite at the optimum".to_string())
    })?;
    let derivs = sigma_derivatives(model, theta)?;
    let scaled: Vec<Array2<f64>> = derivs.iter().map(|d| sigma_inv.dot(d)).collect();

    let q = theta.len();
    let mut info = Array2::zeros((q, q));
    for i in 0..q {
        for j in 0..=i {
            // tr(A B) without forming the product.
            let a = &scaled[i];
            let b = &scaled[j];
            let p = a.nrows();
            let mut trace = 0.0;
            for r in 0..p {
                for c in 0..p {
                    trace += a[(r, c)] * b[(c, r)];
                }
            }
            let value = 0.5 * trace;
            info[(i, j)] = value;
            info[(j, i)] = value;
        }
    }
    Ok(info)
}

/// Observed unit information: half the numerical Hessian of the discrepancy.
fn observed_information_unit(
    model: &SemModel,
    s: &Array2<f64>,
    logdet_s: f64,
    theta: &[f64],
) -> Result<Array2<f64>> {
    let q = theta.len();
    let f0 = ml_discrepancy(model, s, logdet_s, theta);
    let eps: Vec<f64> = theta.iter().map(|t| 1e-4 * t.abs().max(1.0)).collect();
    let f_at = |work: &[f64]| ml_discrepancy(model, s, logdet_s, work);

    let mut hessian = Array2::zeros((q, q));
    let mut work = theta.to_vec();
    for i in 0..q {
        work[i] = theta[i] + eps[i];
        let f_plus = f_at(&work);
        work[i] = theta[i] - eps[i];
        let f_minus = f_at(&work);
        work[i] = theta[i];
        hessian[(i, i)] = (f_plus - 2.0 * f0 + f_minus) / (eps[i] * eps[i]);
    }
    for i in 0..q {
        for j in 0..i {
            work[i] = theta[i] + eps[i];
            work[j] = theta[j] + eps[j];
            let fpp = f_at(&work);
            work[j] = theta[j] - eps[j];
            let fpm = f_at(&work);
            work[i] = theta[i] - eps[i];
            let fmm = f_at(&work);
            work[j] = theta[j] + eps[j];
            let fmp = f_at(&work);
            work[i] = theta[i];
            work[j] = theta[j];
            let value = (fpp - fpm - fmp + fmm) / (4.0 * eps[i] * eps[j]);
            hessian[(i, j)] = value;
            hessian[(j, i)] = value;
        }
    }
    if hessian.iter().any(|v| !v.is_finite()) {
        return Err(SemError::Linalg(
            "non-finite entries in the numerical Hessian".to_string(),
        ));
    }
    Ok(hessian / 2.0)
}

/// Asymptotic covariance of theta-hat and its standard errors:
/// vcov = I_unit^-1 / n_scale, with n_scale matching the chi-square
/// convention. A singular information matrix degrades the implicated
/// standard errors to NaN and attaches a warning instead of failing.
pub(crate) fn infer(
    model: &SemModel,
    s: &Array2<f64>,
    logdet_s: f64,
    theta: &[f64],
    n_scale: f64,
    information: Information,
) -> Result<Inference> {
    let q = theta.len();
    if q == 0 {
        return Ok(Inference {
            vcov: Array2::zeros((0, 0)),
            se: Vec::new(),
            warning: None,
        });
    }

    let unit = match information {
        Information::Expected => expected_information_unit(model, theta)?,
        Information::Observed => observed_information_unit(model, s, logdet_s, theta)?,
    };

    let (eigvals, eigvecs) = eigh_sym(&unit)?;
    let max_eig = eigvals.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max_eig.is_finite() || max_eig <= 0.0 {
        return Ok(Inference::undefined(model));
    }
    let tol = max_eig * SINGULAR_RTOL;

    let mut affected = vec![false; q];
    let mut singular = false;
    for (k, &val) in eigvals.iter().enumerate() {
        if val <= tol {
            singular = true;
            for i in 0..q {
                if eigvecs[(i, k)].abs() > 1e-6 {
                    affected[i] = true;
                }
            }
        }
    }

    // Pseudo-inverse when singular; plain inverse otherwise.
    let vcov_unit = inverse_from_eigh(&eigvals, &eigvecs, Some(tol));
    let vcov = vcov_unit / n_scale;

    let se: Vec<f64> = (0..q)
        .map(|i| {
            if affected[i] {
                return f64::NAN;
            }
            let v = vcov[(i, i)];
            if v.is_finite() && v >= 0.0 {
                v.sqrt()
            } else {
                f64::NAN
            }
        })
        .collect();

    let warning = if singular {
        let names = model.free_param_names();
        let params: Vec<String> = affected
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(i, _)| names[i].clone())
            .collect();
        debug!(?params, "information matrix singular");
        Some(FitWarning::SingularInformation { params })
    } else {
        None
    };

    Ok(Inference { vcov, se, warning })
}
