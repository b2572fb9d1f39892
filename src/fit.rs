use std::cell::Cell;

use ndarray::Array2;
use nlopt::{Algorithm, Nlopt, Target, approximate_gradient};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, warn};

use crate::error::{Result, SemError};
use crate::implied::sigma_at;
use crate::linalg::{from_array2, inverse_spd, logdet_sym, to_array2};
use crate::model::{self, SemModel};
use crate::parser::parse_model;
use crate::se;
use crate::stats::{self, Baseline, StatsContext};
use crate::types::{FitOptions, FitWarning, ParamEstimate, SampleMoments, SemFit, SemInput};

/// The seam between the engine and its callers.
pub trait SemEngine {
    fn fit(&self, input: &SemInput) -> Result<SemFit>;
}

#[derive(Debug, Clone, Default)]
pub struct SemEngineImpl;

impl SemEngine for SemEngineImpl {
    fn fit(&self, input: &SemInput) -> Result<SemFit> {
        fit(input)
    }
}

/// Gaussian maximum-likelihood discrepancy
/// F(theta) = log det Sigma + tr(S Sigma^-1) - log det S - p.
/// Structurally or numerically infeasible points evaluate to +infinity,
/// never NaN, so the optimizer steers away from them.
pub(crate) fn ml_discrepancy(
    model: &SemModel,
    s: &Array2<f64>,
    logdet_s: f64,
    theta: &[f64],
) -> f64 {
    let sigma = match sigma_at(model, theta) {
        Ok(v) => v,
        Err(_) => return f64::INFINITY,
    };
    let logdet = logdet_sym(&sigma);
    if !logdet.is_finite() {
        return f64::INFINITY;
    }
    let inv = match inverse_spd(&sigma) {
        Some(v) => v,
        None => return f64::INFINITY,
    };
    let trace = s.dot(&inv).diag().sum();
    let p = s.nrows() as f64;
    let f = logdet + trace - logdet_s - p;
    if f.is_finite() { f } else { f64::INFINITY }
}

struct ObjData<'a> {
    model: &'a SemModel,
    s: &'a Array2<f64>,
    logdet_s: f64,
    /// Every discrepancy evaluation, gradient probes included.
    evals: Cell<usize>,
    /// Optimizer steps, the unit the evaluation budget is counted in.
    steps: Cell<usize>,
    bad_streak: Cell<usize>,
}

fn evaluate(theta: &[f64], data: &ObjData<'_>) -> f64 {
    data.evals.set(data.evals.get() + 1);
    let f = ml_discrepancy(data.model, data.s, data.logdet_s, theta);
    if f.is_finite() {
        data.bad_streak.set(0);
    } else {
        data.bad_streak.set(data.bad_streak.get() + 1);
    }
    f
}

pub(crate) struct OptimOutcome {
    pub theta: Vec<f64>,
    pub fx: f64,
    pub evaluations: usize,
    pub converged: bool,
}

/// Minimize the discrepancy with a bound-constrained quasi-Newton routine
/// (SLSQP) and finite-difference gradients. Variance non-negativity is
/// enforced through the optimizer's box constraints, not reparameterization.
/// The evaluation cap is also the cooperative cancellation point.
pub(crate) fn minimize(
    model: &SemModel,
    s: &Array2<f64>,
    logdet_s: f64,
    options: &FitOptions,
) -> Result<OptimOutcome> {
    let mut theta = model.theta_start();

    if theta.is_empty() {
        // Fully-fixed model: nothing to optimize, evaluate once.
        let fx = ml_discrepancy(model, s, logdet_s, &theta);
        if !fx.is_finite() {
            return Err(SemError::OptimizationFailure {
                evaluations: 1,
                bad_streak: 1,
            });
        }
        return Ok(OptimOutcome {
            theta,
            fx,
            evaluations: 1,
            converged: true,
        });
    }

    let data = ObjData {
        model,
        s,
        logdet_s,
        evals: Cell::new(0),
        steps: Cell::new(0),
        bad_streak: Cell::new(0),
    };

    let obj = |x: &[f64], grad: Option<&mut [f64]>, data: &mut ObjData| -> f64 {
        data.steps.set(data.steps.get() + 1);
        let f = evaluate(x, data);
        if let Some(g) = grad {
            approximate_gradient(x, |x| evaluate(x, data), g);
        }
        f
    };

    let mut opt = Nlopt::new(Algorithm::Slsqp, theta.len(), obj, Target::Minimize, data);
    let _ = opt.set_ftol_rel(options.ftol);
    let _ = opt.set_maxeval(options.iter_max as u32);
    let _ = opt.set_lower_bounds(&model.lower_bounds());

    let result = opt.optimize(&mut theta);
    let data = opt.recover_user_data();
    let evaluations = data.evals.get();
    let trailing_bad = data.bad_streak.get();
    let fx = ml_discrepancy(model, s, logdet_s, &theta);

    if !fx.is_finite() || trailing_bad >= options.diverge_limit {
        return Err(SemError::OptimizationFailure {
            evaluations,
            bad_streak: trailing_bad,
        });
    }

    let budget_exhausted = data.steps.get() >= options.iter_max;
    let converged = match &result {
        Ok(_) => !budget_exhausted,
        Err((fail, _)) => {
            warn!("optimizer stopped early: {fail:?}");
            false
        }
    };

    debug!(evaluations, fx, converged, "optimization finished");

    Ok(OptimOutcome {
        theta,
        fx,
        evaluations,
        converged,
    })
}

/// Fit a model to sample moments: parse, normalize, build, check
/// identification, optimize, then derive inference and fit statistics.
pub fn fit(input: &SemInput) -> Result<SemFit> {
    input.sample.validate()?;

    let spec = parse_model(&input.model)?;
    let table = model::normalize(&spec, &input.sample.names, &input.options)?;
    let model = SemModel::build(&table, &input.sample)?;

    let p = model.p();
    let df = model.degrees_of_freedom();
    if df < 0 {
        return Err(SemError::Underidentified {
            free: model.free.len(),
            moments: p * (p + 1) / 2,
            df,
        });
    }

    let s = to_array2(&input.sample.cov)?;
    let logdet_s = logdet_sym(&s);
    if !logdet_s.is_finite() {
        return Err(SemError::InvalidSampleMoments(
            "sample covariance matrix is not positive definite".to_string(),
        ));
    }

    let outcome = minimize(&model, &s, logdet_s, &input.options)?;
    let mut warnings = Vec::new();
    if !outcome.converged {
        warnings.push(FitWarning::NonConvergence {
            evaluations: outcome.evaluations,
        });
    }

    let sigma_hat = sigma_at(&model, &outcome.theta)?;
    let residual = &s - &sigma_hat;

    let n_scale = input.options.scale.factor(input.sample.n_obs);
    let inference = match se::infer(
        &model,
        &s,
        logdet_s,
        &outcome.theta,
        n_scale,
        input.options.information,
    ) {
        Ok(inference) => inference,
        Err(err) => {
            warn!("inference degraded: {err}");
            se::Inference::undefined(&model)
        }
    };
    if let Some(warning) = inference.warning.clone() {
        warnings.push(warning);
    }

    let baseline = fit_baseline(&input.sample, &s, logdet_s, &input.options, p);

    let stats = stats::compute_stats(&StatsContext {
        s: &s,
        sigma: &sigma_hat,
        fx: outcome.fx,
        df,
        npar: model.free.len(),
        n_obs: input.sample.n_obs,
        n_scale,
        baseline,
    });

    let params = build_param_estimates(&model, &outcome.theta, &inference.se)?;

    Ok(SemFit {
        params,
        stats,
        theta: outcome.theta,
        vcov: from_array2(&inference.vcov),
        implied: from_array2(&sigma_hat),
        residual: from_array2(&residual),
        converged: outcome.converged,
        evaluations: outcome.evaluations,
        npar: model.free.len(),
        warnings,
    })
}

/// Independence model on the same moments; feeds the incremental fit
/// indices. Failure here degrades the indices to NaN, never the target fit.
fn fit_baseline(
    sample: &SampleMoments,
    s: &Array2<f64>,
    logdet_s: f64,
    options: &FitOptions,
    p: usize,
) -> Option<Baseline> {
    let table = model::baseline_table(sample);
    let baseline_model = match SemModel::build(&table, sample) {
        Ok(m) => m,
        Err(err) => {
            warn!("baseline model build failed: {err}");
            return None;
        }
    };
    match minimize(&baseline_model, s, logdet_s, options) {
        Ok(outcome) => Some(Baseline {
            fx: outcome.fx,
            df: (p * (p + 1) / 2) as i64 - p as i64,
        }),
        Err(err) => {
            warn!("baseline model fit failed: {err}");
            None
        }
    }
}

fn build_param_estimates(
    model: &SemModel,
    theta: &[f64],
    se: &[f64],
) -> Result<Vec<ParamEstimate>> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| SemError::Linalg(e.to_string()))?;
    let mut out = Vec::with_capacity(model.slots.len());
    for slot in &model.slots {
        let est = if slot.free_idx > 0 {
            theta.get(slot.free_idx - 1).copied().unwrap_or(f64::NAN)
        } else {
            slot.fixed.unwrap_or(f64::NAN)
        };
        let se_val = if slot.free_idx > 0 {
            se.get(slot.free_idx - 1).copied().unwrap_or(f64::NAN)
        } else {
            f64::NAN
        };
        let z = est / se_val;
        let p_value = if z.is_finite() {
            2.0 * (1.0 - normal.cdf(z.abs()))
        } else {
            f64::NAN
        };
        out.push(ParamEstimate {
            lhs: slot.lhs.clone(),
            op: slot.op.symbol().to_string(),
            rhs: slot.rhs.clone(),
            label: slot.label.clone(),
            free: slot.free_idx,
            est,
            se: se_val,
            z,
            p_value,
        });
    }
    Ok(out)
}
