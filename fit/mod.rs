//! # Fitting Seams
//!
//! The mixed-model solver and the MCMC sampler are external collaborators.
//! This module defines what they consume ([`spec::ModelSpec`],
//! [`design::ModelData`]) and what they return ([`FrequentistFit`],
//! [`posterior::PosteriorFit`]), the path-keyed fit cache, and a CmdStan
//! bridge that drives an out-of-process sampler.
//!
//! Convergence problems reported by a fitter are [`FitWarning`]s: they are
//! logged and carried on the result, and never abort the pipeline.

pub mod cache;
pub mod design;
pub mod posterior;
pub mod spec;
pub mod stan;

use crate::fit::cache::CacheError;
use crate::fit::design::ModelData;
use crate::fit::posterior::{PosteriorFit, SamplerConfig};
use crate::fit::spec::ModelSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Non-fatal diagnostics from a fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitWarning {
    /// Chains disagree for this parameter.
    HighRhat { parameter: String, rhat: f64 },
    /// Post-warmup transitions that diverged, summed over chains.
    Divergent { transitions: usize },
    /// Free-text convergence message from a fitter (e.g. a singular fit).
    Convergence { message: String },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::HighRhat { parameter, rhat } => write!(
                f,
                "R-hat for '{parameter}' is {rhat:.3}; chains have not mixed. Consider more iterations."
            ),
            FitWarning::Divergent { transitions } => write!(
                f,
                "{transitions} divergent transitions after warmup. Consider increasing adapt_delta."
            ),
            FitWarning::Convergence { message } => write!(f, "{message}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("CmdStan installation not found: {0}")]
    CmdStanNotFound(String),
    #[error("Stan model compilation failed:\n{0}")]
    Compile(String),
    #[error("Chain {chain} failed:\n{message}")]
    Chain { chain: usize, message: String },
    #[error("Could not read sampler output: {0}")]
    Output(String),
    #[error("Failed to create chain thread pool: {0}")]
    ThreadPool(String),
    #[error("Fitting backend failed: {0}")]
    Backend(String),
    #[error("IO error during fitting: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode sampler data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Fit cache error: {0}")]
    Cache(#[from] CacheError),
}

/// One fixed-effect row of a frequentist coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    /// t (or z) statistic.
    pub statistic: f64,
    /// Not every solver reports one.
    pub p_value: Option<f64>,
}

/// Point estimates from a frequentist mixed-model solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequentistFit {
    pub formula: String,
    /// Intercept first, then `ModelSpec::fixed_effects` in order.
    pub coefficients: Vec<Coefficient>,
    /// Standard deviation of the random intercepts.
    pub group_sd: f64,
    pub residual_sd: f64,
    pub n_obs: usize,
    pub n_groups: usize,
    #[serde(default)]
    pub warnings: Vec<FitWarning>,
}

/// A point-estimate mixed-model solver. Deterministic for a given input.
pub trait FrequentistFitter {
    fn fit(&self, spec: &ModelSpec, data: &ModelData) -> Result<FrequentistFit, FitError>;
}

/// An MCMC sampler producing posterior draws across chains.
pub trait Sampler {
    fn sample(
        &self,
        spec: &ModelSpec,
        data: &ModelData,
        config: &SamplerConfig,
    ) -> Result<PosteriorFit, FitError>;
}

/// Runs a frequentist fit and surfaces its warnings through the log.
pub fn fit_frequentist<F: FrequentistFitter + ?Sized>(
    fitter: &F,
    spec: &ModelSpec,
    data: &ModelData,
) -> Result<FrequentistFit, FitError> {
    log::info!("Fitting {spec} to {} observations", data.n_obs());
    let fit = fitter.fit(spec, data)?;
    for warning in &fit.warnings {
        log::warn!("{warning}");
    }
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::spec::Response;

    struct SingularFitter;

    impl FrequentistFitter for SingularFitter {
        fn fit(&self, spec: &ModelSpec, data: &ModelData) -> Result<FrequentistFit, FitError> {
            Ok(FrequentistFit {
                formula: spec.to_string(),
                coefficients: Vec::new(),
                group_sd: 0.0,
                residual_sd: 1.0,
                n_obs: data.n_obs(),
                n_groups: data.n_groups(),
                warnings: vec![FitWarning::Convergence {
                    message: "boundary (singular) fit".to_string(),
                }],
            })
        }
    }

    #[test]
    fn warnings_do_not_abort_the_fit() {
        let spec = ModelSpec::tutorial(Response::LookingTime);
        let data = ModelData {
            response: Response::LookingTime,
            terms: spec.fixed_effects.clone(),
            y: ndarray::array![1.0, 2.0],
            x: ndarray::Array2::zeros((2, 3)),
            group: vec![1, 1],
            group_labels: vec!["s1".to_string()],
        };
        let fit = fit_frequentist(&SingularFitter, &spec, &data).unwrap();
        assert_eq!(fit.n_obs, 2);
        assert_eq!(fit.warnings.len(), 1);
        assert_eq!(fit.warnings[0].to_string(), "boundary (singular) fit");
    }
}
