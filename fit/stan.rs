//! CmdStan bridge
//!
//! Drives an external Stan installation as the Bayesian fitter:
//! - renders a Stan program for the random-intercept model described by a
//!   [`ModelSpec`], priors included
//! - compiles it through CmdStan's `make` (skipped when the executable is
//!   newer than the program)
//! - runs one sampler process per chain on a pool of `cores` threads
//! - reads the per-chain CSV output back into a [`PosteriorFit`]
//!
//! The random intercepts are non-centred (`r = sd * z`), which samples far
//! better than the centred form when groups hold few trials.

use crate::fit::design::ModelData;
use crate::fit::posterior::{PosteriorFit, SamplerConfig};
use crate::fit::spec::{ModelSpec, PriorClass, PriorDistribution};
use crate::fit::{FitError, FitWarning, Sampler};
use itertools::Itertools;
use ndarray::Array3;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Chains whose R-hat exceeds this are reported.
pub const RHAT_WARNING_THRESHOLD: f64 = 1.05;

/// Prior used for `sigma` and `sd` when the `ModelSpec` leaves them unset.
const DEFAULT_SCALE_PRIOR: PriorDistribution = PriorDistribution::StudentT {
    df: 3.0,
    location: 0.0,
    scale: 2.5,
};

/// Finds CmdStan via the `CMDSTAN` environment variable or common install
/// locations.
pub fn detect_cmdstan() -> Result<PathBuf, FitError> {
    if let Ok(path) = std::env::var("CMDSTAN") {
        let path = PathBuf::from(path);
        if path.join("makefile").exists() {
            return Ok(path);
        }
        return Err(FitError::CmdStanNotFound(format!(
            "CMDSTAN points to {}, which has no makefile",
            path.display()
        )));
    }

    if let Ok(home) = std::env::var("HOME") {
        let candidates = Path::new(&home).join(".cmdstan");
        if let Ok(entries) = fs::read_dir(&candidates) {
            let newest = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.join("makefile").exists())
                .max();
            if let Some(path) = newest {
                return Ok(path);
            }
        }
    }

    Err(FitError::CmdStanNotFound(
        "set the CMDSTAN environment variable or the `cmdstan` config entry".to_string(),
    ))
}

/// Runs sampling through a local CmdStan installation.
#[derive(Debug, Clone)]
pub struct CmdStanSampler {
    cmdstan_home: PathBuf,
    work_dir: PathBuf,
}

impl CmdStanSampler {
    pub fn new(cmdstan_home: PathBuf, work_dir: PathBuf) -> Result<Self, FitError> {
        if !cmdstan_home.join("makefile").exists() {
            return Err(FitError::CmdStanNotFound(format!(
                "{} does not look like a CmdStan installation",
                cmdstan_home.display()
            )));
        }
        Ok(Self {
            cmdstan_home,
            work_dir,
        })
    }

    /// Writes the program (only when its text differs) and compiles it.
    fn compile(&self, spec: &ModelSpec) -> Result<PathBuf, FitError> {
        fs::create_dir_all(&self.work_dir)?;
        let work_dir = fs::canonicalize(&self.work_dir)?;
        let stan_file = work_dir.join(format!("{}.stan", model_name(spec)));
        let exe_path = stan_file.with_extension("");

        let program = render_program(spec);
        let unchanged = fs::read_to_string(&stan_file).is_ok_and(|current| current == program);
        if !unchanged {
            fs::write(&stan_file, &program)?;
        }

        if unchanged && exe_path.exists() {
            let stan_modified = fs::metadata(&stan_file)?.modified()?;
            let exe_modified = fs::metadata(&exe_path)?.modified()?;
            if exe_modified > stan_modified {
                log::debug!("Reusing compiled model {}", exe_path.display());
                return Ok(exe_path);
            }
        }

        log::info!("Compiling Stan model {}", stan_file.display());
        let output = Command::new("make")
            .current_dir(&self.cmdstan_home)
            .arg(exe_path.to_string_lossy().to_string())
            .output()?;
        if !output.status.success() {
            return Err(FitError::Compile(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(exe_path)
    }

    fn run_chain(
        &self,
        exe_path: &Path,
        data_file: &Path,
        chain: usize,
        config: &SamplerConfig,
    ) -> Result<PathBuf, FitError> {
        let output_file = data_file.with_file_name(format!("output_{chain}.csv"));
        let mut cmd = Command::new(exe_path);
        cmd.arg("sample")
            .arg(format!("num_warmup={}", config.warmup))
            .arg(format!("num_samples={}", config.draws_per_chain()))
            .arg("adapt")
            .arg(format!("delta={}", config.adapt_delta))
            .arg("algorithm=hmc")
            .arg("engine=nuts")
            .arg(format!("max_depth={}", config.max_treedepth))
            .arg(format!("id={chain}"))
            .arg("data")
            .arg(format!("file={}", data_file.display()))
            .arg("output")
            .arg(format!("file={}", output_file.display()));

        if let Some(seed) = config.seed {
            cmd.arg("random")
                .arg(format!("seed={}", chain_seed(seed, chain)));
        }

        log::debug!("Starting chain {chain}");
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(FitError::Chain {
                chain,
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        log::info!("Chain {chain}/{} finished", config.chains);
        Ok(output_file)
    }
}

impl Sampler for CmdStanSampler {
    fn sample(
        &self,
        spec: &ModelSpec,
        data: &ModelData,
        config: &SamplerConfig,
    ) -> Result<PosteriorFit, FitError> {
        config.validate().map_err(FitError::InvalidConfig)?;
        let exe_path = self.compile(spec)?;

        let data_file = exe_path.with_file_name(format!("{}_data.json", model_name(spec)));
        fs::write(&data_file, serde_json::to_string(&data.to_stan_json()?)?)?;

        let threads = config.cores.min(config.chains).min(num_cpus::get()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| FitError::ThreadPool(e.to_string()))?;
        log::info!("Running {} chains on {threads} threads", config.chains);

        let chain_files = pool.install(|| {
            (1..=config.chains)
                .into_par_iter()
                .map(|chain| self.run_chain(&exe_path, &data_file, chain, config))
                .collect::<Result<Vec<PathBuf>, FitError>>()
        })?;

        let chains = chain_files
            .iter()
            .map(|path| {
                let text = fs::read_to_string(path)?;
                parse_chain_csv(&text)
            })
            .collect::<Result<Vec<ChainOutput>, FitError>>()?;

        assemble_fit(spec, data, config, chains)
    }
}

fn model_name(spec: &ModelSpec) -> String {
    format!("lookfit_{}", spec.response.column_name())
}

/// Chains get consecutive seeds, wrapping within CmdStan's 32-bit range.
fn chain_seed(seed: u32, chain: usize) -> u32 {
    seed.wrapping_add(chain as u32)
}

fn prior_statement(target: &str, distribution: &PriorDistribution) -> String {
    match *distribution {
        PriorDistribution::Normal { mean, sd } => {
            format!("  target += normal_lpdf({target} | {mean:?}, {sd:?});")
        }
        PriorDistribution::StudentT {
            df,
            location,
            scale,
        } => format!("  target += student_t_lpdf({target} | {df:?}, {location:?}, {scale:?});"),
        PriorDistribution::Exponential { rate } => {
            format!("  target += exponential_lpdf({target} | {rate:?});")
        }
    }
}

/// Stan source for `spec`. Unset priors on `Intercept` and `b` are flat.
pub fn render_program(spec: &ModelSpec) -> String {
    let terms = spec
        .fixed_effects
        .iter()
        .enumerate()
        .map(|(k, term)| format!("//   b[{}] = {}", k + 1, term.column_name()))
        .join("\n");

    let mut priors = Vec::new();
    if let Some(prior) = spec.prior_for(PriorClass::Intercept) {
        priors.push(prior_statement("Intercept", prior));
    }
    if let Some(prior) = spec.prior_for(PriorClass::B) {
        priors.push(prior_statement("b", prior));
    }
    priors.push(prior_statement(
        "sigma",
        spec.prior_for(PriorClass::Sigma).unwrap_or(&DEFAULT_SCALE_PRIOR),
    ));
    priors.push(prior_statement(
        "sd_1",
        spec.prior_for(PriorClass::Sd).unwrap_or(&DEFAULT_SCALE_PRIOR),
    ));

    format!(
        "// {spec}\n\
         {terms}\n\
         data {{\n\
         \x20 int<lower=1> N;\n\
         \x20 int<lower=1> K;\n\
         \x20 matrix[N, K] X;\n\
         \x20 vector[N] Y;\n\
         \x20 int<lower=1> J;\n\
         \x20 array[N] int<lower=1, upper=J> g;\n\
         }}\n\
         parameters {{\n\
         \x20 real Intercept;\n\
         \x20 vector[K] b;\n\
         \x20 real<lower=0> sigma;\n\
         \x20 real<lower=0> sd_1;\n\
         \x20 vector[J] z_1;\n\
         }}\n\
         transformed parameters {{\n\
         \x20 vector[J] r_1 = sd_1 * z_1;\n\
         }}\n\
         model {{\n\
         \x20 vector[N] mu = Intercept + X * b + r_1[g];\n\
         \x20 target += normal_lpdf(Y | mu, sigma);\n\
         {}\n\
         \x20 target += std_normal_lpdf(z_1);\n\
         }}\n",
        priors.join("\n")
    )
}

/// Header and post-warmup rows of one chain's output.
#[derive(Debug, Clone, PartialEq)]
struct ChainOutput {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

fn parse_chain_csv(text: &str) -> Result<ChainOutput, FitError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| FitError::Output(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| FitError::Output(e.to_string()))?;
        let values = record
            .iter()
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|_| FitError::Output(format!("non-numeric draw '{v}'")))
            })
            .collect::<Result<Vec<f64>, FitError>>()?;
        rows.push(values);
    }
    if rows.is_empty() {
        return Err(FitError::Output("chain output contains no draws".to_string()));
    }
    Ok(ChainOutput { columns, rows })
}

/// Maps a Stan column name to the reported parameter name. `None` drops the
/// column (sampler diagnostics and the raw `z_1` offsets).
fn parameter_name(column: &str, spec: &ModelSpec, data: &ModelData) -> Option<String> {
    let grouping = spec.grouping.column_name();
    if column == "Intercept" {
        return Some("b_Intercept".to_string());
    }
    if column == "sigma" {
        return Some("sigma".to_string());
    }
    if column == "sd_1" {
        return Some(format!("sd_{grouping}__Intercept"));
    }
    if let Some(k) = column.strip_prefix("b.") {
        let term = spec.fixed_effects.get(k.parse::<usize>().ok()?.checked_sub(1)?)?;
        return Some(format!("b_{}", term.column_name()));
    }
    if let Some(j) = column.strip_prefix("r_1.") {
        let label = data.group_labels.get(j.parse::<usize>().ok()?.checked_sub(1)?)?;
        return Some(format!("r_{grouping}[{label},Intercept]"));
    }
    None
}

fn assemble_fit(
    spec: &ModelSpec,
    data: &ModelData,
    config: &SamplerConfig,
    chains: Vec<ChainOutput>,
) -> Result<PosteriorFit, FitError> {
    let first = chains
        .first()
        .ok_or_else(|| FitError::Output("no chain output".to_string()))?;
    for chain in &chains {
        if chain.columns != first.columns {
            return Err(FitError::Output("chains report different columns".to_string()));
        }
    }
    let n_draws = chains.iter().map(|c| c.rows.len()).min().unwrap_or(0);

    let kept: Vec<(usize, String)> = first
        .columns
        .iter()
        .enumerate()
        .filter_map(|(i, col)| parameter_name(col, spec, data).map(|name| (i, name)))
        .collect();

    let draws = Array3::from_shape_fn((chains.len(), n_draws, kept.len()), |(c, d, p)| {
        chains[c].rows[d][kept[p].0]
    });
    let parameters: Vec<String> = kept.into_iter().map(|(_, name)| name).collect();

    let mut warnings = Vec::new();
    if let Some(div) = first.columns.iter().position(|c| c == "divergent__") {
        let transitions = chains
            .iter()
            .flat_map(|c| c.rows.iter().take(n_draws))
            .filter(|row| row[div] > 0.0)
            .count();
        if transitions > 0 {
            warnings.push(FitWarning::Divergent { transitions });
        }
    }

    let mut fit = PosteriorFit {
        formula: spec.to_string(),
        parameters,
        draws,
        warnings: Vec::new(),
        config: config.clone(),
    };
    for name in &fit.parameters {
        if let Some(value) = fit.rhat_of(name).filter(|r| *r > RHAT_WARNING_THRESHOLD) {
            warnings.push(FitWarning::HighRhat {
                parameter: name.clone(),
                rhat: value,
            });
        }
    }
    fit.warnings = warnings;

    log::info!(
        "Collected {} draws x {} chains for {} parameters",
        fit.n_draws(),
        fit.n_chains(),
        fit.parameters.len()
    );
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::spec::{Prior, Response};
    use ndarray::{Array2, array};

    fn data() -> ModelData {
        ModelData {
            response: Response::LookingTime,
            terms: ModelSpec::tutorial(Response::LookingTime).fixed_effects,
            y: array![5.0, 6.0, 7.0],
            x: Array2::zeros((3, 3)),
            group: vec![1, 2, 2],
            group_labels: vec!["s1".to_string(), "s2".to_string()],
        }
    }

    const CHAIN_HEADER: &str = "lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,Intercept,b.1,b.2,b.3,sigma,sd_1,z_1.1,z_1.2,r_1.1,r_1.2";

    fn chain_csv(offset: f64, divergent_last: bool) -> String {
        let mut text = String::from("# model = lookfit_looking_time\n# num_samples = 3\n");
        text.push_str(CHAIN_HEADER);
        text.push('\n');
        text.push_str("# Adaptation terminated\n");
        for d in 0..3 {
            let div = if divergent_last && d == 2 { 1 } else { 0 };
            let base = offset + d as f64 * 0.1;
            text.push_str(&format!(
                "-10.5,0.9,0.3,3,7,{div},12.1,{base},0.1,0.2,0.3,1.5,0.8,0.4,-0.4,0.32,-0.32\n"
            ));
        }
        text
    }

    #[test]
    fn program_includes_given_priors_and_defaults() {
        let spec = ModelSpec::tutorial(Response::LookingTime)
            .with_priors(&[
                Prior {
                    class: PriorClass::Intercept,
                    distribution: PriorDistribution::Normal { mean: 10.0, sd: 1.0 },
                },
                Prior {
                    class: PriorClass::B,
                    distribution: PriorDistribution::Normal { mean: 0.0, sd: 1.0 },
                },
            ])
            .unwrap();
        let program = render_program(&spec);
        assert!(program.contains("target += normal_lpdf(Intercept | 10.0, 1.0);"));
        assert!(program.contains("target += normal_lpdf(b | 0.0, 1.0);"));
        assert!(program.contains("target += student_t_lpdf(sigma | 3.0, 0.0, 2.5);"));
        assert!(program.contains("target += student_t_lpdf(sd_1 | 3.0, 0.0, 2.5);"));
        assert!(program.contains("//   b[3] = centered_age:stimulus_indicator"));
        assert!(program.contains("  vector[N] mu = Intercept + X * b + r_1[g];"));
    }

    #[test]
    fn program_without_priors_leaves_location_parameters_flat() {
        let program = render_program(&ModelSpec::tutorial(Response::LogLookingTime));
        assert!(!program.contains("(Intercept |"));
        assert!(!program.contains("(b |"));
        assert!(program.starts_with("// log_looking_time ~ 1 + centered_age"));
    }

    #[test]
    fn parses_chain_output_skipping_comments() {
        let chain = parse_chain_csv(&chain_csv(10.0, false)).unwrap();
        assert_eq!(chain.columns.len(), 17);
        assert_eq!(chain.rows.len(), 3);
        assert_eq!(chain.rows[1][7], 10.1);
    }

    #[test]
    fn empty_or_malformed_output_is_an_error() {
        let header_only = format!("{CHAIN_HEADER}\n");
        assert!(matches!(parse_chain_csv(&header_only), Err(FitError::Output(_))));
        let bad = format!("{CHAIN_HEADER}\n-1,0.9,0.3,3,7,0,12,abc,0,0,0,1,1,0,0,0,0\n");
        assert!(matches!(parse_chain_csv(&bad), Err(FitError::Output(_))));
    }

    #[test]
    fn assembles_named_parameters_and_warnings() {
        let spec = ModelSpec::tutorial(Response::LookingTime);
        let chains = vec![
            parse_chain_csv(&chain_csv(10.0, true)).unwrap(),
            parse_chain_csv(&chain_csv(50.0, false)).unwrap(),
        ];
        let config = SamplerConfig::default();
        let fit = assemble_fit(&spec, &data(), &config, chains).unwrap();

        assert_eq!(
            fit.parameters,
            vec![
                "b_Intercept",
                "b_centered_age",
                "b_stimulus_indicator",
                "b_centered_age:stimulus_indicator",
                "sigma",
                "sd_subject_id__Intercept",
                "r_subject_id[s1,Intercept]",
                "r_subject_id[s2,Intercept]",
            ]
        );
        assert_eq!(fit.draws.dim(), (2, 3, 8));
        assert!(fit.warnings.contains(&FitWarning::Divergent { transitions: 1 }));
        assert!(fit.warnings.iter().any(|w| matches!(
            w,
            FitWarning::HighRhat { parameter, .. } if parameter == "b_Intercept"
        )));
    }

    #[test]
    fn chain_seeds_fit_in_32_bits() {
        assert_eq!(chain_seed(100, 1), 101);
        assert_eq!(chain_seed(u32::MAX, 1), 0);
    }

    #[test]
    fn missing_installation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = CmdStanSampler::new(dir.path().to_path_buf(), dir.path().join("work"));
        assert!(matches!(result, Err(FitError::CmdStanNotFound(_))));
    }
}
