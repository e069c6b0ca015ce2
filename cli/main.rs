#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use lookfit::clean::clean_with_summary;
use lookfit::config::PipelineConfig;
use lookfit::data::load_table;
use lookfit::fit::cache::fit_with_cache;
use lookfit::fit::design::ModelData;
use lookfit::fit::{FitError, Sampler};
use lookfit::fit::posterior::{PosteriorFit, SamplerConfig};
use lookfit::fit::spec::{ModelSpec, Response};
use lookfit::fit::stan::CmdStanSampler;
use lookfit::report::predictive::posterior_predictive;
use lookfit::report::trends::{age_group_trends, trend_table};
use lookfit::report::{posterior_table, summarize_posterior};
use lookfit::transform::{PreparedTable, transform};

#[derive(Clone, Copy, ValueEnum)]
pub enum ResponseCli {
    /// Looking time in seconds
    Raw,
    /// Natural log of looking time
    Log,
}

impl From<ResponseCli> for Response {
    fn from(value: ResponseCli) -> Self {
        match value {
            ResponseCli::Raw => Response::LookingTime,
            ResponseCli::Log => Response::LogLookingTime,
        }
    }
}

#[derive(Args)]
pub struct SourceArgs {
    /// Pipeline configuration file (.toml); omitted fields use tutorial defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// URL or local path of the trial table (overrides the config file)
    #[arg(long)]
    pub source: Option<String>,
}

#[derive(Args)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Directory for prepared.csv and model_spec.toml
    #[arg(long, default_value = "output")]
    pub out: PathBuf,

    #[arg(long, value_enum)]
    pub response: Option<ResponseCli>,
}

#[derive(Args)]
pub struct BayesArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long, value_enum)]
    pub response: Option<ResponseCli>,

    /// Fit cache file (.toml), suffixed with the response column
    /// (fit.toml -> fit_log_looking_time.toml); an existing file is reused
    /// without sampling. Defaults to models/fit_<response>.toml
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Base seed (32-bit); chain c uses seed + c
    #[arg(long)]
    pub seed: Option<u32>,

    /// CmdStan installation (overrides the config file and CMDSTAN)
    #[arg(long)]
    pub cmdstan: Option<PathBuf>,

    /// Replicated data sets for the posterior predictive check
    #[arg(long, default_value = "200")]
    pub ppc_draws: usize,

    /// Probability mass of the reported posterior intervals
    #[arg(long, default_value = "0.95")]
    pub prob: f64,
}

#[derive(Args)]
pub struct ReportArgs {
    /// Cached fit (.toml) written by `lookfit bayes`
    #[arg(long)]
    pub cache: PathBuf,

    #[arg(long, default_value = "0.95")]
    pub prob: f64,
}

#[derive(Parser)]
#[command(
    name = "lookfit",
    about = "Mixed-effects modelling pipeline for infant looking-time data",
    long_about = "Loads and cleans trial-level looking-time data, derives model columns, \
                 and fits the tutorial random-intercept model through CmdStan."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Clean and transform the data (outputs: prepared.csv, model_spec.toml)")]
    Prepare(PrepareArgs),
    #[command(about = "Fit the Bayesian model through CmdStan and summarise the posterior")]
    Bayes(BayesArgs),
    #[command(about = "Summarise an existing cached fit")]
    Report(ReportArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Prepare(args)) => run_prepare(args),
        Some(Commands::Bayes(args)) => run_bayes(args),
        Some(Commands::Report(args)) => run_report(args),
        Some(Commands::Version) => {
            println!("lookfit {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Locates CmdStan only when sampling actually runs, so a cache hit works
/// without an installation.
struct DeferredCmdStan<'a> {
    config: &'a PipelineConfig,
}

impl Sampler for DeferredCmdStan<'_> {
    fn sample(
        &self,
        spec: &ModelSpec,
        data: &ModelData,
        sampler_config: &SamplerConfig,
    ) -> Result<PosteriorFit, FitError> {
        let home = self.config.cmdstan_home()?;
        CmdStanSampler::new(home, self.config.work_dir.clone())?.sample(spec, data, sampler_config)
    }
}

/// Config file first, then command-line overrides.
fn resolve_config(
    args: &SourceArgs,
    response: Option<ResponseCli>,
) -> Result<PipelineConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(source) = &args.source {
        config.source = source.clone();
    }
    if let Some(response) = response {
        config.response = response.into();
    }
    Ok(config)
}

fn load_prepared(config: &PipelineConfig) -> Result<PreparedTable, Box<dyn Error>> {
    let source = config.data_source();
    log::info!("Loading trial table from {source}");
    let raw = load_table(&source)?;
    let (clean, summary) = clean_with_summary(&raw, &config.filter);
    println!(
        "Kept {} of {} rows ({} wrong method, {} wrong language group, {} incomplete)",
        summary.kept,
        raw.len(),
        summary.wrong_method,
        summary.wrong_language_group,
        summary.incomplete
    );
    Ok(transform(&clean, config.reference_level)?)
}

fn run_prepare(args: PrepareArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args.source, args.response)?;
    let spec = config.model_spec()?;
    let table = load_prepared(&config)?;

    fs::create_dir_all(&args.out)?;
    let csv_path = args.out.join("prepared.csv");
    table.write_csv(BufWriter::new(fs::File::create(&csv_path)?))?;
    let spec_path = args.out.join("model_spec.toml");
    spec.save(&spec_path)?;

    println!("Mean age: {:.3} months", table.age_mean());
    println!("Model: {spec}");
    println!("Trend cells (trial:mean looking time):");
    println!("{}", trend_table(&age_group_trends(&table)));
    println!(
        "Wrote {} and {}",
        csv_path.display(),
        spec_path.display()
    );
    Ok(())
}

fn run_bayes(args: BayesArgs) -> Result<(), Box<dyn Error>> {
    let mut config = resolve_config(&args.source, args.response)?;
    if let Some(cache) = args.cache {
        config.sampler.cache_file = Some(cache);
    }
    if let Some(seed) = args.seed {
        config.sampler.seed = Some(seed);
    }
    if let Some(cmdstan) = args.cmdstan {
        config.cmdstan = Some(cmdstan);
    }

    let spec = config.model_spec()?;
    let table = load_prepared(&config)?;
    let data = ModelData::assemble(&spec, &table);

    let sampler_config = config.sampler_for_response();
    let sampler = DeferredCmdStan { config: &config };
    let fit = fit_with_cache(&sampler, &spec, &data, &sampler_config)?;

    print_posterior(&fit, args.prob)?;
    let check = posterior_predictive(
        &fit,
        &data,
        args.ppc_draws,
        u64::from(sampler_config.seed.unwrap_or_default()),
    )?;
    println!("{}", check.to_table());
    Ok(())
}

fn run_report(args: ReportArgs) -> Result<(), Box<dyn Error>> {
    if !args.cache.exists() {
        return Err(format!("cache file '{}' does not exist", args.cache.display()).into());
    }
    let fit = PosteriorFit::load(&args.cache)?;
    print_posterior(&fit, args.prob)
}

fn print_posterior(fit: &PosteriorFit, prob: f64) -> Result<(), Box<dyn Error>> {
    println!("Formula: {}", fit.formula);
    println!(
        "Draws: {} chains x {} post-warmup",
        fit.n_chains(),
        fit.n_draws()
    );
    let summaries = summarize_posterior(fit, prob)?;
    println!("{}", posterior_table(&summaries, prob));
    for warning in &fit.warnings {
        println!("Warning: {warning}");
    }
    Ok(())
}
