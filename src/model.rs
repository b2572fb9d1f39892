use std::collections::{HashMap, HashSet};

use ndarray::Array2;

use crate::error::{Result, SemError};
use crate::parser::{CoefSpec, Line, ModelOp, ModelSpec};
use crate::types::{FitOptions, SampleMoments};

/// Which structural matrix a parameter writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatKind {
    /// Loadings, observed x latent.
    Lambda,
    /// Structural paths, latent x latent, zero diagonal.
    Beta,
    /// Residual covariance, observed x observed, symmetric.
    Theta,
    /// Factor covariance, latent x latent, symmetric.
    Psi,
}

/// One row of the fully-specified parameter table produced by [`normalize`].
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub lhs: String,
    pub op: ModelOp,
    pub rhs: String,
    pub free: bool,
    /// Fixed value; NaN when the parameter is free.
    pub fixed: f64,
    pub start: Option<f64>,
    pub label: Option<String>,
}

impl ParameterSpec {
    fn free_with(start: Option<f64>, label: Option<String>, lhs: &str, op: ModelOp, rhs: &str) -> Self {
        ParameterSpec {
            lhs: lhs.to_string(),
            op,
            rhs: rhs.to_string(),
            free: true,
            fixed: f64::NAN,
            start,
            label,
        }
    }

    fn fixed_at(value: f64, lhs: &str, op: ModelOp, rhs: &str) -> Self {
        ParameterSpec {
            lhs: lhs.to_string(),
            op,
            rhs: rhs.to_string(),
            free: false,
            fixed: value,
            start: None,
            label: None,
        }
    }
}

/// Normalized model: the complete parameter table plus the variable roster.
#[derive(Debug, Clone)]
pub struct ParameterTable {
    pub rows: Vec<ParameterSpec>,
    /// Observed-variable universe the model was resolved against, in order.
    pub observed: Vec<String>,
    /// Latent variables in declaration order.
    pub latents: Vec<String>,
}

fn render_statement(line: &Line) -> String {
    let terms: Vec<&str> = line.terms.iter().map(|t| t.var.as_str()).collect();
    format!("{} {} {}", line.lhs, line.op.symbol(), terms.join(" + "))
}

fn canonical_key(lhs: &str, op: ModelOp, rhs: &str) -> (String, ModelOp, String) {
    if op == ModelOp::Cov && rhs < lhs {
        (rhs.to_string(), op, lhs.to_string())
    } else {
        (lhs.to_string(), op, rhs.to_string())
    }
}

/// Explicit post-parse normalization pass. Resolves every variable name,
/// applies the default behaviors (marker loadings, implicit variances,
/// implicit exogenous-factor covariances), collapses duplicate declarations,
/// and validates scale identification. The output is a fully-specified
/// parameter table; the matrix builder adds nothing behind its back.
pub fn normalize(
    spec: &ModelSpec,
    observed: &[String],
    options: &FitOptions,
) -> Result<ParameterTable> {
    let obs_set: HashSet<&str> = observed.iter().map(|s| s.as_str()).collect();

    let mut latents: Vec<String> = Vec::new();
    for line in &spec.lines {
        if line.op == ModelOp::Measure {
            if obs_set.contains(line.lhs.as_str()) {
                return Err(SemError::UnsupportedStatement {
                    statement: render_statement(line),
                    reason: format!("`{}` is an observed variable and cannot be measured", line.lhs),
                });
            }
            if !latents.contains(&line.lhs) {
                latents.push(line.lhs.clone());
            }
        }
    }
    let latent_set: HashSet<&str> = latents.iter().map(|s| s.as_str()).collect();
    let known = |name: &str| obs_set.contains(name) || latent_set.contains(name);

    let mut rows: Vec<ParameterSpec> = Vec::new();
    let mut index: HashMap<(String, ModelOp, String), usize> = HashMap::new();
    // Latents whose leading indicator has already been seen.
    let mut marker_seen: HashSet<String> = HashSet::new();
    // Latents with an incoming structural path (includes lower-order factors).
    let mut endogenous: HashSet<String> = HashSet::new();

    for line in &spec.lines {
        let statement = render_statement(line);
        match line.op {
            ModelOp::Measure => {
                for term in &line.terms {
                    if !known(&term.var) {
                        return Err(SemError::UnknownVariable {
                            name: term.var.clone(),
                            statement: statement.clone(),
                        });
                    }
                    let mut coef = term.coef.clone();
                    if !marker_seen.contains(&line.lhs) {
                        marker_seen.insert(line.lhs.clone());
                        if coef == CoefSpec::None && !options.std_lv {
                            coef = CoefSpec::Fixed(1.0);
                        }
                    }
                    if latent_set.contains(term.var.as_str()) {
                        endogenous.insert(term.var.clone());
                    }
                    let row = spec_from_coef(&coef, &line.lhs, ModelOp::Measure, &term.var);
                    merge_row(&mut rows, &mut index, row)?;
                }
            }
            ModelOp::Regress => {
                if !known(&line.lhs) {
                    return Err(SemError::UnknownVariable {
                        name: line.lhs.clone(),
                        statement: statement.clone(),
                    });
                }
                for term in &line.terms {
                    if !known(&term.var) {
                        return Err(SemError::UnknownVariable {
                            name: term.var.clone(),
                            statement: statement.clone(),
                        });
                    }
                    if term.var == line.lhs {
                        return Err(SemError::UnsupportedStatement {
                            statement: statement.clone(),
                            reason: format!("`{}` cannot be regressed on itself", line.lhs),
                        });
                    }
                    if !latent_set.contains(term.var.as_str()) {
                        return Err(SemError::UnsupportedStatement {
                            statement: statement.clone(),
                            reason: format!(
                                "regression onto observed variable `{}` is outside the covariance-structure core",
                                term.var
                            ),
                        });
                    }
                    if latent_set.contains(line.lhs.as_str()) {
                        endogenous.insert(line.lhs.clone());
                    }
                    let row = spec_from_coef(&term.coef, &line.lhs, ModelOp::Regress, &term.var);
                    merge_row(&mut rows, &mut index, row)?;
                }
            }
            ModelOp::Cov => {
                if !known(&line.lhs) {
                    return Err(SemError::UnknownVariable {
                        name: line.lhs.clone(),
                        statement: statement.clone(),
                    });
                }
                for term in &line.terms {
                    if !known(&term.var) {
                        return Err(SemError::UnknownVariable {
                            name: term.var.clone(),
                            statement: statement.clone(),
                        });
                    }
                    let lhs_latent = latent_set.contains(line.lhs.as_str());
                    let rhs_latent = latent_set.contains(term.var.as_str());
                    if lhs_latent != rhs_latent {
                        return Err(SemError::UnsupportedStatement {
                            statement: statement.clone(),
                            reason: format!(
                                "covariance between observed `{}` and latent `{}` is not expressible",
                                if lhs_latent { &term.var } else { &line.lhs },
                                if lhs_latent { &line.lhs } else { &term.var }
                            ),
                        });
                    }
                    let row = spec_from_coef(&term.coef, &line.lhs, ModelOp::Cov, &term.var);
                    merge_row(&mut rows, &mut index, row)?;
                }
            }
        }
    }

    // Implicit variances for every variable without an explicit declaration.
    for name in observed.iter().chain(latents.iter()) {
        let key = canonical_key(name, ModelOp::Cov, name);
        if index.contains_key(&key) {
            continue;
        }
        let row = if options.std_lv && latent_set.contains(name.as_str()) {
            ParameterSpec::fixed_at(1.0, name, ModelOp::Cov, name)
        } else {
            ParameterSpec::free_with(None, None, name, ModelOp::Cov, name)
        };
        merge_row(&mut rows, &mut index, row)?;
    }

    // Implicit covariances among exogenous latent variables.
    for i in 0..latents.len() {
        for j in (i + 1)..latents.len() {
            if endogenous.contains(&latents[i]) || endogenous.contains(&latents[j]) {
                continue;
            }
            let key = canonical_key(&latents[i], ModelOp::Cov, &latents[j]);
            if index.contains_key(&key) {
                continue;
            }
            let row = ParameterSpec::free_with(None, None, &latents[i], ModelOp::Cov, &latents[j]);
            merge_row(&mut rows, &mut index, row)?;
        }
    }

    // Scale identification: exactly one mechanism per latent variable.
    for latent in &latents {
        let fixed_loading = rows
            .iter()
            .any(|r| r.op == ModelOp::Measure && r.lhs == *latent && !r.free);
        let fixed_variance = rows
            .iter()
            .any(|r| r.op == ModelOp::Cov && r.lhs == *latent && r.rhs == *latent && !r.free);
        let mechanisms = usize::from(fixed_loading) + usize::from(fixed_variance);
        if mechanisms != 1 {
            return Err(SemError::ScaleIdentification {
                latent: latent.clone(),
                mechanisms,
            });
        }
    }

    Ok(ParameterTable {
        rows,
        observed: observed.to_vec(),
        latents,
    })
}

fn spec_from_coef(coef: &CoefSpec, lhs: &str, op: ModelOp, rhs: &str) -> ParameterSpec {
    match coef {
        CoefSpec::Fixed(v) => ParameterSpec::fixed_at(*v, lhs, op, rhs),
        CoefSpec::Start(v) => ParameterSpec::free_with(Some(*v), None, lhs, op, rhs),
        CoefSpec::Label(l) => ParameterSpec::free_with(None, Some(l.clone()), lhs, op, rhs),
        CoefSpec::Free | CoefSpec::None => ParameterSpec::free_with(None, None, lhs, op, rhs),
    }
}

fn merge_row(
    rows: &mut Vec<ParameterSpec>,
    index: &mut HashMap<(String, ModelOp, String), usize>,
    row: ParameterSpec,
) -> Result<()> {
    let key = canonical_key(&row.lhs, row.op, &row.rhs);
    if let Some(&at) = index.get(&key) {
        let existing = &mut rows[at];
        if !existing.free && !row.free && existing.fixed != row.fixed {
            return Err(SemError::DuplicateParameter {
                lhs: row.lhs,
                op: row.op.symbol().to_string(),
                rhs: row.rhs,
                first: existing.fixed,
                second: row.fixed,
            });
        }
        // An explicit fix wins over a free redeclaration; labels and starts
        // keep the first value seen.
        if existing.free && !row.free {
            existing.free = false;
            existing.fixed = row.fixed;
        }
        if existing.label.is_none() {
            existing.label = row.label;
        }
        if existing.start.is_none() {
            existing.start = row.start;
        }
        return Ok(());
    }
    index.insert(key, rows.len());
    rows.push(row);
    Ok(())
}

/// One writable (or fixed) cell of the structural matrices.
#[derive(Debug, Clone)]
pub struct ParamSlot {
    pub lhs: String,
    pub op: ModelOp,
    pub rhs: String,
    pub kind: MatKind,
    pub row: usize,
    pub col: usize,
    pub symmetric: bool,
    /// 1-based index into the free-parameter vector; 0 when fixed.
    pub free_idx: usize,
    pub fixed: Option<f64>,
    pub start: Option<f64>,
    pub label: Option<String>,
}

/// One entry of the free-parameter vector.
#[derive(Debug, Clone)]
pub struct FreeParam {
    pub label: Option<String>,
    pub start: f64,
    /// Lower bound handed to the optimizer; variances are bounded at zero.
    pub lower: Option<f64>,
}

/// Structural matrices rebuilt from theta on every evaluation. Plain value
/// types; no incremental updates.
#[derive(Debug, Clone)]
pub struct ModelMatrices {
    pub lambda: Array2<f64>,
    pub theta: Array2<f64>,
    pub psi: Array2<f64>,
    pub beta: Array2<f64>,
}

/// Parameter table mapped onto matrix cells plus the free-parameter order.
#[derive(Debug, Clone)]
pub struct SemModel {
    /// Observed variables in sample order; Lambda and Theta rows follow it.
    pub obs_names: Vec<String>,
    pub latent_names: Vec<String>,
    pub slots: Vec<ParamSlot>,
    pub free: Vec<FreeParam>,
}

impl SemModel {
    /// Map a normalized parameter table onto matrix slots, verifying that the
    /// table's observed-variable universe matches the sample.
    pub fn build(table: &ParameterTable, sample: &SampleMoments) -> Result<SemModel> {
        let sample_set: HashSet<&str> = sample.names.iter().map(|s| s.as_str()).collect();
        let table_set: HashSet<&str> = table.observed.iter().map(|s| s.as_str()).collect();
        let missing: Vec<String> = table
            .observed
            .iter()
            .filter(|n| !sample_set.contains(n.as_str()))
            .cloned()
            .collect();
        let unused: Vec<String> = sample
            .names
            .iter()
            .filter(|n| !table_set.contains(n.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() || !unused.is_empty() {
            return Err(SemError::VariableMismatch { missing, unused });
        }

        let obs_idx: HashMap<&str, usize> = sample
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let lat_idx: HashMap<&str, usize> = table
            .latents
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let row_statement =
            |row: &ParameterSpec| format!("{} {} {}", row.lhs, row.op.symbol(), row.rhs);
        let obs_of = |name: &str, row: &ParameterSpec| {
            obs_idx
                .get(name)
                .copied()
                .ok_or_else(|| SemError::UnknownVariable {
                    name: name.to_string(),
                    statement: row_statement(row),
                })
        };
        let lat_of = |name: &str, row: &ParameterSpec| {
            lat_idx
                .get(name)
                .copied()
                .ok_or_else(|| SemError::UnknownVariable {
                    name: name.to_string(),
                    statement: row_statement(row),
                })
        };

        let mut slots = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let lhs_lat = lat_idx.get(row.lhs.as_str()).copied();
            let rhs_lat = lat_idx.get(row.rhs.as_str()).copied();
            let (kind, r, c) = match row.op {
                ModelOp::Measure => {
                    let col = lat_of(&row.lhs, row)?;
                    match rhs_lat {
                        // Higher-order factor: the indicator is itself latent.
                        Some(lower) => (MatKind::Beta, lower, col),
                        None => (MatKind::Lambda, obs_of(&row.rhs, row)?, col),
                    }
                }
                ModelOp::Regress => {
                    let col = lat_of(&row.rhs, row)?;
                    match lhs_lat {
                        Some(target) => (MatKind::Beta, target, col),
                        None => (MatKind::Lambda, obs_of(&row.lhs, row)?, col),
                    }
                }
                ModelOp::Cov => match (lhs_lat, rhs_lat) {
                    (Some(i), Some(j)) => (MatKind::Psi, i, j),
                    (None, None) => (
                        MatKind::Theta,
                        obs_of(&row.lhs, row)?,
                        obs_of(&row.rhs, row)?,
                    ),
                    _ => {
                        return Err(SemError::UnsupportedStatement {
                            statement: row_statement(row),
                            reason: "covariance between observed and latent variables".to_string(),
                        });
                    }
                },
            };
            slots.push(ParamSlot {
                lhs: row.lhs.clone(),
                op: row.op,
                rhs: row.rhs.clone(),
                kind,
                row: r,
                col: c,
                symmetric: matches!(kind, MatKind::Theta | MatKind::Psi) && r != c,
                free_idx: 0,
                fixed: if row.free { None } else { Some(row.fixed) },
                start: row.start,
                label: row.label.clone(),
            });
        }

        let free = assign_free_params(&mut slots, sample);

        Ok(SemModel {
            obs_names: sample.names.clone(),
            latent_names: table.latents.clone(),
            slots,
            free,
        })
    }

    pub fn p(&self) -> usize {
        self.obs_names.len()
    }

    pub fn m(&self) -> usize {
        self.latent_names.len()
    }

    /// df = p(p+1)/2 - q. Negative means the model is under-identified.
    pub fn degrees_of_freedom(&self) -> i64 {
        let p = self.p();
        (p * (p + 1) / 2) as i64 - self.free.len() as i64
    }

    pub fn theta_start(&self) -> Vec<f64> {
        self.free.iter().map(|f| f.start).collect()
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.free
            .iter()
            .map(|f| f.lower.unwrap_or(f64::NEG_INFINITY))
            .collect()
    }

    /// Human-readable name per free parameter, for diagnostics.
    pub fn free_param_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.free.len()];
        for slot in &self.slots {
            if slot.free_idx > 0 && names[slot.free_idx - 1].is_empty() {
                names[slot.free_idx - 1] = match &slot.label {
                    Some(label) => label.clone(),
                    None => format!("{} {} {}", slot.lhs, slot.op.symbol(), slot.rhs),
                };
            }
        }
        names
    }

    /// Rebuild the structural matrices from a candidate theta.
    pub fn build_matrices(&self, theta: &[f64]) -> ModelMatrices {
        let p = self.p();
        let m = self.m();
        let mut lambda = Array2::zeros((p, m));
        let mut theta_m = Array2::zeros((p, p));
        let mut psi = Array2::zeros((m, m));
        let mut beta = Array2::zeros((m, m));
        for slot in &self.slots {
            let value = if slot.free_idx > 0 {
                theta.get(slot.free_idx - 1).copied().unwrap_or(f64::NAN)
            } else {
                slot.fixed.unwrap_or(f64::NAN)
            };
            match slot.kind {
                MatKind::Lambda => lambda[(slot.row, slot.col)] = value,
                MatKind::Beta => beta[(slot.row, slot.col)] = value,
                MatKind::Theta => {
                    theta_m[(slot.row, slot.col)] = value;
                    if slot.symmetric {
                        theta_m[(slot.col, slot.row)] = value;
                    }
                }
                MatKind::Psi => {
                    psi[(slot.row, slot.col)] = value;
                    if slot.symmetric {
                        psi[(slot.col, slot.row)] = value;
                    }
                }
            }
        }
        ModelMatrices {
            lambda,
            theta: theta_m,
            psi,
            beta,
        }
    }
}

fn assign_free_params(slots: &mut [ParamSlot], sample: &SampleMoments) -> Vec<FreeParam> {
    let mut free: Vec<FreeParam> = Vec::new();
    let mut label_map: HashMap<String, usize> = HashMap::new();

    for slot in slots.iter_mut() {
        if slot.fixed.is_some() {
            slot.free_idx = 0;
            continue;
        }
        if let Some(label) = &slot.label
            && let Some(&idx) = label_map.get(label)
        {
            slot.free_idx = idx;
            continue;
        }
        let idx = free.len() + 1;
        slot.free_idx = idx;
        if let Some(label) = &slot.label {
            label_map.insert(label.clone(), idx);
        }
        let variance = matches!(slot.kind, MatKind::Theta | MatKind::Psi) && slot.row == slot.col;
        free.push(FreeParam {
            label: slot.label.clone(),
            start: slot.start.unwrap_or_else(|| default_start(slot, sample)),
            lower: if variance { Some(0.0) } else { None },
        });
    }
    free
}

fn default_start(slot: &ParamSlot, sample: &SampleMoments) -> f64 {
    match slot.kind {
        MatKind::Theta if slot.row == slot.col => sample.cov[slot.row][slot.row],
        MatKind::Psi if slot.row == slot.col => 1.0,
        MatKind::Theta | MatKind::Psi => 0.0,
        MatKind::Lambda | MatKind::Beta => 0.1,
    }
}

/// Independence model over the same observed variables: no latents, only
/// free variances. Used as the baseline for incremental fit indices.
pub fn baseline_table(sample: &SampleMoments) -> ParameterTable {
    let rows = sample
        .names
        .iter()
        .map(|name| ParameterSpec::free_with(None, None, name, ModelOp::Cov, name))
        .collect();
    ParameterTable {
        rows,
        observed: sample.names.clone(),
        latents: Vec::new(),
    }
}
