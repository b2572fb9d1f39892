use thiserror::Error;

/// Error taxonomy of the fitting engine.
///
/// Specification errors (`Parse` through `Underidentified`) are raised before
/// any numerical work starts. `SingularStructuralMatrix` is recovered locally
/// by the optimizer as a rejected step and only surfaces from direct
/// covariance evaluation; `OptimizationFailure` is its escalation when no
/// candidate step evaluates to a finite discrepancy. Convergence and
/// information-matrix problems are *not* errors: they are attached to an
/// otherwise valid [`SemFit`](crate::types::SemFit) as warnings.
#[derive(Debug, Error)]
pub enum SemError {
    #[error("failed to parse model line `{line}`: {message}")]
    Parse { line: String, message: String },

    #[error(
        "unknown variable `{name}` in `{statement}`: not an observed variable and never defined by a measurement statement"
    )]
    UnknownVariable { name: String, statement: String },

    #[error("parameter `{lhs} {op} {rhs}` fixed to conflicting values {first} and {second}")]
    DuplicateParameter {
        lhs: String,
        op: String,
        rhs: String,
        first: f64,
        second: f64,
    },

    #[error("unsupported statement `{statement}`: {reason}")]
    UnsupportedStatement { statement: String, reason: String },

    #[error(
        "latent variable `{latent}` has {mechanisms} scale constraints; exactly one fixed loading or one fixed variance is required"
    )]
    ScaleIdentification { latent: String, mechanisms: usize },

    #[error(
        "model variables do not match the sample: missing from sample {missing:?}, unused by model {unused:?}"
    )]
    VariableMismatch {
        missing: Vec<String>,
        unused: Vec<String>,
    },

    #[error("invalid sample moments: {0}")]
    InvalidSampleMoments(String),

    #[error(
        "model is under-identified: {free} free parameters exceed {moments} non-redundant covariance elements (df = {df})"
    )]
    Underidentified {
        free: usize,
        moments: usize,
        df: i64,
    },

    #[error("structural matrix I - B is singular (reciprocal condition number {rcond:.3e})")]
    SingularStructuralMatrix { rcond: f64 },

    #[error(
        "optimization diverged after {evaluations} objective evaluations ({bad_streak} consecutive non-finite values)"
    )]
    OptimizationFailure {
        evaluations: usize,
        bad_streak: usize,
    },

    #[error("linear algebra error: {0}")]
    Linalg(String),
}

pub type Result<T> = std::result::Result<T, SemError>;
