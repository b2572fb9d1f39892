use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::fit::fit;
use crate::types::{SemFit, SemInput};

/// Run a closure inside a dedicated rayon pool when a core count is given,
/// inline otherwise.
pub fn run_in_pool<T, F>(cores: Option<usize>, context: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    if let Some(cores) = cores {
        let pool = ThreadPoolBuilder::new()
            .num_threads(cores)
            .build()
            .context(context)?;
        Ok(pool.install(f))
    } else {
        Ok(f())
    }
}

/// Fit a batch of independent models concurrently. Each fit owns its own
/// moments snapshot and parameter vector; nothing is shared across fits.
pub fn fit_all(
    inputs: &[SemInput],
    cores: Option<usize>,
) -> Result<Vec<crate::error::Result<SemFit>>> {
    run_in_pool(cores, "build fit thread pool", || {
        inputs.par_iter().map(fit).collect()
    })
}
