use std::f64::consts::PI;

use ndarray::Array2;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

use crate::linalg::{cov2cor, inverse_spd, logdet_sym};
use crate::types::FitStats;

/// Baseline (independence) model summary feeding the incremental indices.
pub(crate) struct Baseline {
    pub fx: f64,
    pub df: i64,
}

pub(crate) struct StatsContext<'a> {
    pub s: &'a Array2<f64>,
    pub sigma: &'a Array2<f64>,
    /// Discrepancy at the optimum.
    pub fx: f64,
    pub df: i64,
    pub npar: usize,
    pub n_obs: f64,
    /// N-1 or N, the convention shared with the standard errors.
    pub n_scale: f64,
    pub baseline: Option<Baseline>,
}

pub(crate) fn compute_stats(ctx: &StatsContext<'_>) -> FitStats {
    let chisq = ctx.n_scale * ctx.fx;
    let p_chisq = chisq_pvalue(chisq, ctx.df);

    let (baseline_chisq, baseline_df) = match &ctx.baseline {
        Some(b) => (ctx.n_scale * b.fx, b.df),
        None => (f64::NAN, 0),
    };

    debug!(
        chisq,
        df = ctx.df,
        baseline_chisq,
        baseline_df,
        npar = ctx.npar,
        n_obs = ctx.n_obs,
        "fit statistics"
    );

    let cfi = compute_cfi(chisq, ctx.df as f64, baseline_chisq, baseline_df as f64);
    let tli = compute_tli(chisq, ctx.df as f64, baseline_chisq, baseline_df as f64);
    let rmsea = compute_rmsea(chisq, ctx.df as f64, ctx.n_obs);
    let srmr = compute_srmr(ctx.s, ctx.sigma);

    let loglik = gaussian_loglik(ctx.s, ctx.sigma, ctx.n_obs);
    let aic = -2.0 * loglik + 2.0 * ctx.npar as f64;
    let bic = -2.0 * loglik + ctx.npar as f64 * ctx.n_obs.ln();

    debug!(cfi, tli, rmsea, srmr, loglik, aic, bic, "fit indices");

    FitStats {
        chisq,
        df: ctx.df,
        p_chisq,
        baseline_chisq,
        baseline_df,
        cfi,
        tli,
        rmsea,
        srmr,
        loglik,
        aic,
        bic,
    }
}

fn chisq_pvalue(statistic: f64, df: i64) -> f64 {
    if df <= 0 || !statistic.is_finite() {
        return f64::NAN;
    }
    match ChiSquared::new(df as f64) {
        Ok(chi) => 1.0 - chi.cdf(statistic.max(0.0)),
        Err(_) => f64::NAN,
    }
}

fn compute_cfi(chisq: f64, df: f64, baseline_chisq: f64, baseline_df: f64) -> f64 {
    if !baseline_chisq.is_finite() {
        return f64::NAN;
    }
    let num = (chisq - df).max(0.0);
    let den = (baseline_chisq - baseline_df).max(0.0);
    if den == 0.0 {
        return if num == 0.0 { 1.0 } else { f64::NAN };
    }
    (1.0 - num / den).clamp(0.0, 1.0)
}

fn compute_tli(chisq: f64, df: f64, baseline_chisq: f64, baseline_df: f64) -> f64 {
    if !baseline_chisq.is_finite() || df <= 0.0 || baseline_df <= 0.0 {
        return f64::NAN;
    }
    let baseline_ratio = baseline_chisq / baseline_df;
    let denom = baseline_ratio - 1.0;
    if denom == 0.0 {
        return f64::NAN;
    }
    (baseline_ratio - chisq / df) / denom
}

fn compute_rmsea(chisq: f64, df: f64, n_obs: f64) -> f64 {
    if df <= 0.0 || n_obs <= 1.0 {
        return f64::NAN;
    }
    ((chisq / df - 1.0) / (n_obs - 1.0)).max(0.0).sqrt()
}

/// Root-mean-square residual in correlation metric over the lower triangle,
/// diagonal included.
fn compute_srmr(s: &Array2<f64>, sigma: &Array2<f64>) -> f64 {
    let r_obs = cov2cor(s);
    let r_hat = cov2cor(sigma);
    let p = r_obs.nrows();
    let mut sum = 0.0;
    let mut count = 0.0;
    for i in 0..p {
        for j in 0..=i {
            let diff = r_obs[(i, j)] - r_hat[(i, j)];
            sum += diff * diff;
            count += 1.0;
        }
    }
    if count == 0.0 {
        f64::NAN
    } else {
        (sum / count).sqrt()
    }
}

/// Gaussian log-likelihood of the sample at the implied covariance. Uses N
/// itself regardless of the chi-square scale convention.
fn gaussian_loglik(s: &Array2<f64>, sigma: &Array2<f64>, n_obs: f64) -> f64 {
    let p = s.nrows() as f64;
    let logdet = logdet_sym(sigma);
    let trace = match inverse_spd(sigma) {
        Some(inv) => s.dot(&inv).diag().sum(),
        None => return f64::NAN,
    };
    -0.5 * n_obs * (p * (2.0 * PI).ln() + logdet + trace)
}
