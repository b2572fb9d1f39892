use semfit::implied::implied_covariance;
use semfit::model::{MatKind, SemModel, normalize};
use semfit::parser::{CoefSpec, ModelOp, parse_model};
use semfit::{FitOptions, SampleMoments, SemError};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn identity_sample(vars: &[&str]) -> SampleMoments {
    let p = vars.len();
    let mut cov = vec![vec![0.0; p]; p];
    for (i, row) in cov.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    SampleMoments::new(cov, 100.0, names(vars)).expect("sample moments")
}

fn set_free(model: &SemModel, theta: &mut [f64], lhs: &str, op: &str, rhs: &str, value: f64) {
    for slot in &model.slots {
        let direct = slot.lhs == lhs && slot.rhs == rhs;
        let flipped = op == "~~" && slot.lhs == rhs && slot.rhs == lhs;
        if slot.free_idx > 0 && slot.op.symbol() == op && (direct || flipped) {
            theta[slot.free_idx - 1] = value;
            return;
        }
    }
    panic!("no free parameter {lhs} {op} {rhs}");
}

#[test]
fn parse_model_smoke() {
    let spec = parse_model("f1 =~ y1 + 0.5*y2\ny2 ~ f1\ny1 ~~ y2").expect("parse model");
    assert_eq!(spec.lines.len(), 3);
    assert_eq!(spec.lines[0].op, ModelOp::Measure);
    assert_eq!(spec.lines[1].op, ModelOp::Regress);
    assert_eq!(spec.lines[2].op, ModelOp::Cov);
    assert_eq!(spec.lines[0].terms.len(), 2);
}

#[test]
fn parse_modifiers() {
    let spec = parse_model("f =~ 1*x1 + NA*x2 + start(0.5)*x3 + lam*x4").expect("parse model");
    let coefs: Vec<&CoefSpec> = spec.lines[0].terms.iter().map(|t| &t.coef).collect();
    assert_eq!(*coefs[0], CoefSpec::Fixed(1.0));
    assert_eq!(*coefs[1], CoefSpec::Free);
    assert_eq!(*coefs[2], CoefSpec::Start(0.5));
    assert_eq!(*coefs[3], CoefSpec::Label("lam".to_string()));
}

#[test]
fn parse_comments_and_separators() {
    let spec = parse_model("f =~ x1 + x2 # trailing comment\nx1 ~~ x2 ; x2 ~~ x3 // tail")
        .expect("parse model");
    assert_eq!(spec.lines.len(), 3);
}

#[test]
fn parse_rejects_garbage() {
    let err = parse_model("f =* x1").unwrap_err();
    assert!(matches!(err, SemError::Parse { .. }));
}

#[test]
fn three_factor_normalization_counts() {
    let model = "\
        visual  =~ x1 + x2 + x3\n\
        textual =~ x4 + x5 + x6\n\
        speed   =~ x7 + x8 + x9";
    let vars = ["x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9"];
    let spec = parse_model(model).expect("parse model");
    let table = normalize(&spec, &names(&vars), &FitOptions::default()).expect("normalize");

    let loadings: Vec<_> = table
        .rows
        .iter()
        .filter(|r| r.op == ModelOp::Measure)
        .collect();
    assert_eq!(loadings.len(), 9);
    let fixed: Vec<&str> = loadings
        .iter()
        .filter(|r| !r.free)
        .map(|r| r.rhs.as_str())
        .collect();
    assert_eq!(fixed, vec!["x1", "x4", "x7"]);

    let variances = table
        .rows
        .iter()
        .filter(|r| r.op == ModelOp::Cov && r.lhs == r.rhs)
        .count();
    assert_eq!(variances, 12);
    let covariances = table
        .rows
        .iter()
        .filter(|r| r.op == ModelOp::Cov && r.lhs != r.rhs)
        .count();
    assert_eq!(covariances, 3);

    let sample = identity_sample(&vars);
    let built = SemModel::build(&table, &sample).expect("build model");
    assert_eq!(built.free.len(), 24);
    assert_eq!(built.degrees_of_freedom(), 21);
}

#[test]
fn std_lv_fixes_variances_not_markers() {
    let options = FitOptions {
        std_lv: true,
        ..FitOptions::default()
    };
    let spec = parse_model("f =~ x1 + x2 + x3").expect("parse model");
    let table = normalize(&spec, &names(&["x1", "x2", "x3"]), &options).expect("normalize");
    assert!(
        table
            .rows
            .iter()
            .filter(|r| r.op == ModelOp::Measure)
            .all(|r| r.free)
    );
    let factor_var = table
        .rows
        .iter()
        .find(|r| r.op == ModelOp::Cov && r.lhs == "f" && r.rhs == "f")
        .expect("factor variance row");
    assert!(!factor_var.free);
    assert_eq!(factor_var.fixed, 1.0);
}

#[test]
fn symmetric_covariance_declarations_merge() {
    let spec = parse_model("f =~ x1 + x2 + x3\nx1 ~~ x2\nx2 ~~ x1").expect("parse model");
    let table =
        normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).expect("normalize");
    let off_diag = table
        .rows
        .iter()
        .filter(|r| r.op == ModelOp::Cov && r.lhs != r.rhs)
        .count();
    assert_eq!(off_diag, 1);
}

#[test]
fn conflicting_fixed_values_are_rejected() {
    let spec = parse_model("f =~ x1 + x2 + x3\nx1 ~~ 0.4*x1\nx1 ~~ 0.6*x1").expect("parse model");
    let err = normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).unwrap_err();
    assert!(matches!(err, SemError::DuplicateParameter { .. }));
}

#[test]
fn unknown_variable_is_rejected() {
    let spec = parse_model("f =~ x1 + x9").expect("parse model");
    let err = normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).unwrap_err();
    match err {
        SemError::UnknownVariable { name, .. } => assert_eq!(name, "x9"),
        other => panic!("expected UnknownVariable, got {other:?}"),
    }
}

#[test]
fn sample_mismatch_is_rejected() {
    let spec = parse_model("f =~ x1 + x2 + x3").expect("parse model");
    let table =
        normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).expect("normalize");
    let sample = identity_sample(&["x1", "x2", "x4"]);
    let err = SemModel::build(&table, &sample).unwrap_err();
    match err {
        SemError::VariableMismatch { missing, unused } => {
            assert_eq!(missing, vec!["x3".to_string()]);
            assert_eq!(unused, vec!["x4".to_string()]);
        }
        other => panic!("expected VariableMismatch, got {other:?}"),
    }
}

#[test]
fn freed_marker_without_other_scale_is_rejected() {
    let spec = parse_model("f =~ NA*x1 + x2 + x3").expect("parse model");
    let err = normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).unwrap_err();
    match err {
        SemError::ScaleIdentification { latent, mechanisms } => {
            assert_eq!(latent, "f");
            assert_eq!(mechanisms, 0);
        }
        other => panic!("expected ScaleIdentification, got {other:?}"),
    }
}

#[test]
fn double_scale_constraint_is_rejected() {
    let options = FitOptions {
        std_lv: true,
        ..FitOptions::default()
    };
    let spec = parse_model("f =~ 1*x1 + x2 + x3").expect("parse model");
    let err = normalize(&spec, &names(&["x1", "x2", "x3"]), &options).unwrap_err();
    assert!(matches!(
        err,
        SemError::ScaleIdentification { mechanisms: 2, .. }
    ));
}

#[test]
fn latent_observed_covariance_is_rejected() {
    let spec = parse_model("f =~ x1 + x2 + x3\nf ~~ x1").expect("parse model");
    let err = normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).unwrap_err();
    assert!(matches!(err, SemError::UnsupportedStatement { .. }));
}

#[test]
fn regression_onto_observed_is_rejected() {
    let spec = parse_model("f =~ x1 + x2\ng =~ x3 + x4\nf ~ x3").expect("parse model");
    let err =
        normalize(&spec, &names(&["x1", "x2", "x3", "x4"]), &FitOptions::default()).unwrap_err();
    assert!(matches!(err, SemError::UnsupportedStatement { .. }));
}

#[test]
fn structural_path_suppresses_implicit_covariance() {
    let model = "f1 =~ x1 + x2 + x3\nf2 =~ x4 + x5 + x6\nf2 ~ f1";
    let vars = ["x1", "x2", "x3", "x4", "x5", "x6"];
    let spec = parse_model(model).expect("parse model");
    let table = normalize(&spec, &names(&vars), &FitOptions::default()).expect("normalize");

    assert!(
        !table
            .rows
            .iter()
            .any(|r| r.op == ModelOp::Cov && r.lhs != r.rhs)
    );

    let sample = identity_sample(&vars);
    let built = SemModel::build(&table, &sample).expect("build model");
    let beta_slots: Vec<_> = built
        .slots
        .iter()
        .filter(|s| s.kind == MatKind::Beta)
        .collect();
    assert_eq!(beta_slots.len(), 1);
    assert_eq!(beta_slots[0].lhs, "f2");
}

#[test]
fn higher_order_factor_maps_to_structural_matrix() {
    let model = "\
        f1 =~ x1 + x2 + x3\n\
        f2 =~ x4 + x5 + x6\n\
        g  =~ f1 + f2";
    let vars = ["x1", "x2", "x3", "x4", "x5", "x6"];
    let spec = parse_model(model).expect("parse model");
    let table = normalize(&spec, &names(&vars), &FitOptions::default()).expect("normalize");
    let sample = identity_sample(&vars);
    let built = SemModel::build(&table, &sample).expect("build model");

    let beta_slots: Vec<_> = built
        .slots
        .iter()
        .filter(|s| s.kind == MatKind::Beta)
        .collect();
    assert_eq!(beta_slots.len(), 2);
    // The leading indicator of the second-order factor is fixed to 1.
    assert_eq!(beta_slots[0].fixed, Some(1.0));
    assert_eq!(beta_slots[0].rhs, "f1");
}

#[test]
fn empty_model_reduces_to_observed_variances() {
    let spec = parse_model("").expect("parse model");
    let table = normalize(&spec, &names(&["y1"]), &FitOptions::default()).expect("normalize");
    let sample = SampleMoments::new(vec![vec![2.0]], 100.0, names(&["y1"])).expect("sample");
    let model = SemModel::build(&table, &sample).expect("build model");
    let theta = model.theta_start();
    let sigma = implied_covariance(&model, &theta).expect("implied");
    assert_eq!(sigma.len(), 1);
    assert!((sigma[0][0] - 2.0).abs() < 1e-12);
}

#[test]
fn implied_covariance_matches_hand_computation() {
    let spec = parse_model("f =~ x1 + x2").expect("parse model");
    let table = normalize(&spec, &names(&["x1", "x2"]), &FitOptions::default()).expect("normalize");
    let sample = identity_sample(&["x1", "x2"]);
    let model = SemModel::build(&table, &sample).expect("build model");

    let mut theta = model.theta_start();
    set_free(&model, &mut theta, "f", "=~", "x2", 0.5);
    set_free(&model, &mut theta, "f", "~~", "f", 2.0);
    set_free(&model, &mut theta, "x1", "~~", "x1", 0.25);
    set_free(&model, &mut theta, "x2", "~~", "x2", 0.25);

    let sigma = implied_covariance(&model, &theta).expect("implied");
    assert!((sigma[0][0] - 2.25).abs() < 1e-12);
    assert!((sigma[0][1] - 1.0).abs() < 1e-12);
    assert!((sigma[1][0] - 1.0).abs() < 1e-12);
    assert!((sigma[1][1] - 0.75).abs() < 1e-12);
}

#[test]
fn shared_labels_alias_one_parameter() {
    let spec = parse_model("f =~ x1 + lam*x2 + lam*x3").expect("parse model");
    let table = normalize(&spec, &names(&["x1", "x2", "x3"]), &FitOptions::default()).expect("normalize");
    let sample = identity_sample(&["x1", "x2", "x3"]);
    let model = SemModel::build(&table, &sample).expect("build model");
    // lam counted once: 1 loading + 3 residuals + 1 factor variance.
    assert_eq!(model.free.len(), 5);
    let indices: Vec<usize> = model
        .slots
        .iter()
        .filter(|s| s.label.as_deref() == Some("lam"))
        .map(|s| s.free_idx)
        .collect();
    assert_eq!(indices.len(), 2);
    assert_eq!(indices[0], indices[1]);
}
