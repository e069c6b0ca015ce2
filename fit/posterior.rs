//! Sampler configuration and the posterior artifact.

use crate::fit::FitWarning;
use crate::fit::cache::CacheError;
use ndarray::{Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Knobs passed through to the sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Warmup iterations per chain, discarded.
    pub warmup: usize,
    /// Total iterations per chain, warmup included.
    pub iter: usize,
    pub chains: usize,
    /// Number of chains allowed to run at once.
    pub cores: usize,
    /// Fixed seed for reproducible draws. `None` lets the sampler choose.
    /// CmdStan seeds are unsigned 32-bit.
    pub seed: Option<u32>,
    /// Target acceptance rate during adaptation.
    pub adapt_delta: f64,
    pub max_treedepth: usize,
    /// Where a completed fit is persisted and reused.
    pub cache_file: Option<PathBuf>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            warmup: 1000,
            iter: 2000,
            chains: 4,
            cores: 4,
            seed: None,
            adapt_delta: 0.99,
            max_treedepth: 10,
            cache_file: None,
        }
    }
}

impl SamplerConfig {
    /// Retained draws per chain.
    pub fn draws_per_chain(&self) -> usize {
        self.iter.saturating_sub(self.warmup)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.warmup >= self.iter {
            return Err(format!(
                "warmup ({}) must be smaller than the total iteration count ({})",
                self.warmup, self.iter
            ));
        }
        if self.chains == 0 {
            return Err("at least one chain is required".to_string());
        }
        if self.cores == 0 {
            return Err("at least one core is required".to_string());
        }
        if !(self.adapt_delta > 0.0 && self.adapt_delta < 1.0) {
            return Err(format!(
                "adapt_delta must lie strictly between 0 and 1, got {}",
                self.adapt_delta
            ));
        }
        if self.max_treedepth == 0 {
            return Err("max_treedepth must be positive".to_string());
        }
        Ok(())
    }
}

/// Posterior draws from a Bayesian fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PosteriorFit {
    /// Formula of the fitted spec, kept for display.
    pub formula: String,
    /// Parameter names, one per slice along the last axis of `draws`.
    pub parameters: Vec<String>,
    /// Shape: [n_chains, n_draws, n_parameters].
    pub draws: Array3<f64>,
    #[serde(default)]
    pub warnings: Vec<FitWarning>,
    pub config: SamplerConfig,
}

impl PosteriorFit {
    pub fn n_chains(&self) -> usize {
        self.draws.len_of(Axis(0))
    }

    pub fn n_draws(&self) -> usize {
        self.draws.len_of(Axis(1))
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p == name)
    }

    /// Per-chain draws for one parameter. Shape: [n_chains, n_draws].
    pub fn chains_of(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.parameter_index(name)
            .map(|idx| self.draws.index_axis(Axis(2), idx))
    }

    /// All draws for one parameter, chains concatenated.
    pub fn draws_of(&self, name: &str) -> Option<Vec<f64>> {
        self.chains_of(name).map(|view| view.iter().copied().collect())
    }

    pub fn posterior_mean_of(&self, name: &str) -> Option<f64> {
        let draws = self.draws_of(name)?;
        if draws.is_empty() {
            return None;
        }
        Some(draws.iter().sum::<f64>() / draws.len() as f64)
    }

    pub fn rhat_of(&self, name: &str) -> Option<f64> {
        self.chains_of(name).map(rhat)
    }

    /// Saves the fit in TOML format.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let toml_string = toml::to_string(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a fit from a TOML file.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let toml_string = fs::read_to_string(path)?;
        let fit = toml::from_str(&toml_string)?;
        Ok(fit)
    }
}

/// Gelman-Rubin potential scale reduction for one parameter.
///
/// `chains` has shape [n_chains, n_draws]. Returns NaN when fewer than two
/// chains or two draws are available. Identical constant chains give 1.
pub fn rhat(chains: ArrayView2<'_, f64>) -> f64 {
    let (n_chains, n_draws) = chains.dim();
    if n_chains < 2 || n_draws < 2 {
        return f64::NAN;
    }
    let m = n_chains as f64;
    let n = n_draws as f64;

    let chain_means: Vec<f64> = chains.rows().into_iter().map(|c| c.sum() / n).collect();
    let chain_vars: Vec<f64> = chains
        .rows()
        .into_iter()
        .zip(&chain_means)
        .map(|(c, mean)| c.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0))
        .collect();

    let grand_mean = chain_means.iter().sum::<f64>() / m;
    let between = n * chain_means
        .iter()
        .map(|mean| (mean - grand_mean).powi(2))
        .sum::<f64>()
        / (m - 1.0);
    let within = chain_vars.iter().sum::<f64>() / m;

    if within == 0.0 {
        return if between == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = ((n - 1.0) * within + between) / n;
    (var_plus / within).sqrt()
}
