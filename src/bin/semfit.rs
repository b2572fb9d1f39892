use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use semfit::logging::init_tracing;
use semfit::{
    CovScale, FitOptions, Information, SampleMoments, SemEngine, SemEngineImpl, SemFit, SemInput,
};

fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let mut model_path = None;
    let mut cov_path = None;
    let mut names = None;
    let mut n_obs = None;
    let mut options = FitOptions::default();
    let mut out_dir = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--model" => {
                i += 1;
                model_path = args.get(i).cloned();
            }
            "--cov" => {
                i += 1;
                cov_path = args.get(i).cloned();
            }
            "--names" => {
                i += 1;
                names = args.get(i).cloned();
            }
            "--nobs" => {
                i += 1;
                if let Some(raw) = args.get(i) {
                    n_obs = Some(raw.parse::<f64>().context("parse --nobs")?);
                }
            }
            "--information" => {
                i += 1;
                if let Some(kind) = args.get(i) {
                    options.information = match kind.as_str() {
                        "observed" => Information::Observed,
                        _ => Information::Expected,
                    };
                }
            }
            "--scale" => {
                i += 1;
                if let Some(kind) = args.get(i) {
                    options.scale = match kind.as_str() {
                        "n" | "N" => CovScale::N,
                        _ => CovScale::NMinusOne,
                    };
                }
            }
            "--std-lv" => {
                options.std_lv = true;
            }
            "--out" => {
                i += 1;
                out_dir = args.get(i).cloned();
            }
            _ => {}
        }
        i += 1;
    }

    let model_path = model_path.context("--model required")?;
    let cov_path = cov_path.context("--cov required")?;
    let names = names.context("--names required")?;
    let n_obs = n_obs.context("--nobs required")?;

    let model = fs::read_to_string(&model_path).context("read model")?;
    let cov = read_matrix(&cov_path).context("read covariance matrix")?;
    let names: Vec<String> = names
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let sample = SampleMoments::new(cov, n_obs, names).context("validate sample moments")?;
    let input = SemInput {
        model,
        sample,
        options,
    };

    let engine = SemEngineImpl;
    let result = engine.fit(&input).context("fit model")?;

    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }

    if let Some(out_dir) = out_dir {
        fs::create_dir_all(&out_dir).context("create output dir")?;
        write_params(Path::new(&out_dir).join("params.tsv"), &result)?;
        write_stats(Path::new(&out_dir).join("stats.tsv"), &result)?;
    } else {
        write_params("/dev/stdout", &result)?;
    }

    Ok(())
}

fn read_matrix(path: &str) -> Result<Vec<Vec<f64>>> {
    let content = fs::read_to_string(path)?;
    let mut lines = content.lines();
    let header = lines.next().context("matrix header")?;
    let dims: Vec<usize> = header
        .split_whitespace()
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse matrix dimensions")?;
    let (n, m) = if dims.len() == 1 {
        (dims[0], dims[0])
    } else if dims.len() == 2 {
        (dims[0], dims[1])
    } else {
        return Err(anyhow::anyhow!("matrix header must be `n [m]`"));
    };

    let mut matrix = vec![vec![0.0; m]; n];
    for row in matrix.iter_mut().take(n) {
        let line = lines.next().context("matrix row")?;
        let vals: Vec<f64> = line
            .split_whitespace()
            .map(|s| s.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parse matrix row")?;
        if vals.len() != m {
            return Err(anyhow::anyhow!("matrix row length mismatch"));
        }
        row[..m].copy_from_slice(&vals[..m]);
    }
    Ok(matrix)
}

fn write_params<P: AsRef<Path>>(path: P, fit: &SemFit) -> Result<()> {
    let mut out = String::new();
    out.push_str("lhs\top\trhs\tfree\test\tse\tz\tp\n");
    for p in &fit.params {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{:.10}\t{:.10}\t{:.6}\t{:.6}\n",
            p.lhs, p.op, p.rhs, p.free, p.est, p.se, p.z, p.p_value
        ));
    }
    fs::write(path, out)?;
    Ok(())
}

fn write_stats<P: AsRef<Path>>(path: P, fit: &SemFit) -> Result<()> {
    let stats = &fit.stats;
    let out = format!(
        "chisq\tdf\tp_chisq\tbaseline_chisq\tbaseline_df\tcfi\ttli\trmsea\tsrmr\tloglik\taic\tbic\n\
         {:.10}\t{}\t{:.10}\t{:.10}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\n",
        stats.chisq,
        stats.df,
        stats.p_chisq,
        stats.baseline_chisq,
        stats.baseline_df,
        stats.cfi,
        stats.tli,
        stats.rmsea,
        stats.srmr,
        stats.loglik,
        stats.aic,
        stats.bic,
    );
    fs::write(path, out)?;
    Ok(())
}
