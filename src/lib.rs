//! Maximum-likelihood covariance-structure (SEM/CFA) fitting engine.
//!
//! The pipeline: a textual model description is parsed and normalized into a
//! complete parameter table; the table is mapped onto structural matrices
//! whose implied covariance is minimized against sample moments; standard
//! errors, Wald tests, and fit statistics are derived from the optimum.

pub mod error;
pub mod fit;
pub mod implied;
mod linalg;
pub mod logging;
pub mod model;
pub mod parallel;
pub mod parser;
mod se;
mod stats;
pub mod types;

pub use error::{Result, SemError};
pub use fit::{SemEngine, SemEngineImpl, fit};
pub use types::*;
