use std::fmt;

use crate::error::{Result, SemError};

/// Row-major dense matrix as exchanged across the public API.
pub type Matrix = Vec<Vec<f64>>;

/// Which information matrix the inference engine inverts for standard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Information {
    Expected,
    Observed,
}

/// Scaling convention shared by the chi-square statistic and the asymptotic
/// parameter covariance. One convention per fit; never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovScale {
    NMinusOne,
    N,
}

impl CovScale {
    pub fn factor(self, n_obs: f64) -> f64 {
        match self {
            CovScale::NMinusOne => n_obs - 1.0,
            CovScale::N => n_obs,
        }
    }
}

/// Observed covariance matrix, sample size, and variable ordering, supplied
/// by the data-loading collaborator. Immutable for the duration of a fit.
#[derive(Debug, Clone)]
pub struct SampleMoments {
    pub cov: Matrix,
    pub n_obs: f64,
    pub names: Vec<String>,
}

impl SampleMoments {
    pub fn new(cov: Matrix, n_obs: f64, names: Vec<String>) -> Result<Self> {
        let moments = SampleMoments { cov, n_obs, names };
        moments.validate()?;
        Ok(moments)
    }

    pub fn p(&self) -> usize {
        self.names.len()
    }

    pub fn validate(&self) -> Result<()> {
        let p = self.names.len();
        if p == 0 {
            return Err(SemError::InvalidSampleMoments(
                "no observed variables".to_string(),
            ));
        }
        if self.cov.len() != p || self.cov.iter().any(|row| row.len() != p) {
            return Err(SemError::InvalidSampleMoments(format!(
                "covariance matrix is not {p}x{p}"
            )));
        }
        for i in 0..p {
            for j in 0..i {
                if (self.cov[i][j] - self.cov[j][i]).abs() > 1e-8 {
                    return Err(SemError::InvalidSampleMoments(format!(
                        "covariance matrix is not symmetric at ({}, {})",
                        self.names[i], self.names[j]
                    )));
                }
            }
        }
        for (i, name) in self.names.iter().enumerate() {
            if self.names[..i].contains(name) {
                return Err(SemError::InvalidSampleMoments(format!(
                    "duplicate variable name `{name}`"
                )));
            }
        }
        if !(self.n_obs > 1.0) {
            return Err(SemError::InvalidSampleMoments(format!(
                "sample size must exceed 1, got {}",
                self.n_obs
            )));
        }
        Ok(())
    }
}

/// Per-fit configuration. Passed explicitly into each fit so concurrent fits
/// with differing conventions cannot interfere.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub information: Information,
    pub scale: CovScale,
    /// Fix factor variances to 1.0 instead of marker loadings.
    pub std_lv: bool,
    /// Relative convergence tolerance on the discrepancy function.
    pub ftol: f64,
    /// Objective-evaluation budget; doubles as the cooperative cancellation
    /// point of the optimization loop.
    pub iter_max: usize,
    /// Consecutive non-finite objective evaluations tolerated before the fit
    /// is declared diverged.
    pub diverge_limit: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            information: Information::Expected,
            scale: CovScale::NMinusOne,
            std_lv: false,
            ftol: 1e-9,
            iter_max: 5000,
            diverge_limit: 25,
        }
    }
}

/// Everything a single fit consumes.
#[derive(Debug, Clone)]
pub struct SemInput {
    pub model: String,
    pub sample: SampleMoments,
    pub options: FitOptions,
}

/// One row of the reported parameter table.
#[derive(Debug, Clone)]
pub struct ParamEstimate {
    pub lhs: String,
    pub op: String,
    pub rhs: String,
    pub label: Option<String>,
    /// 1-based index into the free-parameter vector; 0 for fixed parameters.
    pub free: usize,
    pub est: f64,
    pub se: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Test statistic and derived fit indices.
#[derive(Debug, Clone)]
pub struct FitStats {
    pub chisq: f64,
    pub df: i64,
    pub p_chisq: f64,
    pub baseline_chisq: f64,
    pub baseline_df: i64,
    pub cfi: f64,
    pub tli: f64,
    pub rmsea: f64,
    pub srmr: f64,
    pub loglik: f64,
    pub aic: f64,
    pub bic: f64,
}

/// Non-fatal conditions attached to an otherwise valid fit so downstream
/// reporting can still display best-effort estimates.
#[derive(Debug, Clone, PartialEq)]
pub enum FitWarning {
    NonConvergence { evaluations: usize },
    SingularInformation { params: Vec<String> },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::NonConvergence { evaluations } => write!(
                f,
                "model has not converged after {evaluations} objective evaluations"
            ),
            FitWarning::SingularInformation { params } => write!(
                f,
                "information matrix is singular; standard errors undefined for {params:?}"
            ),
        }
    }
}

/// Result of a successful fit. Immutable once produced.
#[derive(Debug, Clone)]
pub struct SemFit {
    pub params: Vec<ParamEstimate>,
    pub stats: FitStats,
    /// Maximum-likelihood estimate of the free-parameter vector.
    pub theta: Vec<f64>,
    /// Asymptotic covariance matrix of the free parameters.
    pub vcov: Matrix,
    /// Model-implied covariance matrix at the optimum.
    pub implied: Matrix,
    /// Residual matrix S - Sigma(theta-hat).
    pub residual: Matrix,
    pub converged: bool,
    pub evaluations: usize,
    pub npar: usize,
    pub warnings: Vec<FitWarning>,
}
