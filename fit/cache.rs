//! At-most-once fitting keyed by a file path.
//!
//! A fit is reused whenever the configured cache file exists. The key is the
//! path alone: the data and spec are not fingerprinted, so editing either
//! without removing the file returns the stale fit.

use crate::fit::design::ModelData;
use crate::fit::posterior::{PosteriorFit, SamplerConfig};
use crate::fit::spec::ModelSpec;
use crate::fit::{FitError, Sampler};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to read or write fit cache file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML fit cache file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize fit to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Samples `spec` on `data`, or returns the fit stored at
/// `config.cache_file` without invoking the sampler.
pub fn fit_with_cache<S: Sampler + ?Sized>(
    sampler: &S,
    spec: &ModelSpec,
    data: &ModelData,
    config: &SamplerConfig,
) -> Result<PosteriorFit, FitError> {
    if let Some(path) = config.cache_file.as_deref() {
        if path.exists() {
            log::info!(
                "Reusing cached fit from {} (the cache is keyed by path only)",
                path.display()
            );
            let fit = PosteriorFit::load(path)?;
            for warning in &fit.warnings {
                log::warn!("{warning}");
            }
            return Ok(fit);
        }
    }

    config.validate().map_err(FitError::InvalidConfig)?;
    log::info!(
        "Sampling {spec}: {} chains x {} iterations ({} warmup)",
        config.chains,
        config.iter,
        config.warmup
    );
    let fit = sampler.sample(spec, data, config)?;
    for warning in &fit.warnings {
        log::warn!("{warning}");
    }

    if let Some(path) = config.cache_file.as_deref() {
        fit.save(path)?;
        log::info!("Cached fit at {}", path.display());
    }
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::spec::Response;
    use ndarray::{Array2, Array3, array};
    use std::cell::Cell;

    struct CountingSampler {
        calls: Cell<usize>,
    }

    impl Sampler for CountingSampler {
        fn sample(
            &self,
            spec: &ModelSpec,
            data: &ModelData,
            config: &SamplerConfig,
        ) -> Result<PosteriorFit, FitError> {
            self.calls.set(self.calls.get() + 1);
            let offset = self.calls.get() as f64;
            Ok(PosteriorFit {
                formula: spec.to_string(),
                parameters: vec!["b_Intercept".to_string(), "sigma".to_string()],
                draws: Array3::from_shape_fn((config.chains, data.n_obs(), 2), |(c, d, p)| {
                    offset + c as f64 + 0.1 * d as f64 + p as f64
                }),
                warnings: Vec::new(),
                config: config.clone(),
            })
        }
    }

    fn data() -> ModelData {
        ModelData {
            response: Response::LookingTime,
            terms: ModelSpec::tutorial(Response::LookingTime).fixed_effects,
            y: array![5.0, 6.0],
            x: Array2::zeros((2, 3)),
            group: vec![1, 2],
            group_labels: vec!["a".to_string(), "b".to_string()],
        }
    }

    #[test]
    fn second_call_reuses_cached_fit_without_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let config = SamplerConfig {
            chains: 2,
            seed: Some(7),
            cache_file: Some(dir.path().join("models").join("fit_raw.toml")),
            ..SamplerConfig::default()
        };
        let sampler = CountingSampler { calls: Cell::new(0) };
        let spec = ModelSpec::tutorial(Response::LookingTime);

        let first = fit_with_cache(&sampler, &spec, &data(), &config).unwrap();
        assert_eq!(sampler.calls.get(), 1);
        assert!(config.cache_file.as_ref().unwrap().exists());

        let second = fit_with_cache(&sampler, &spec, &data(), &config).unwrap();
        assert_eq!(sampler.calls.get(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn one_path_is_one_fit_whatever_the_spec() {
        // Callers key the path by response; the cache itself only sees the path.
        let dir = tempfile::tempdir().unwrap();
        let config = SamplerConfig {
            chains: 1,
            cache_file: Some(dir.path().join("fit.toml")),
            ..SamplerConfig::default()
        };
        let sampler = CountingSampler { calls: Cell::new(0) };

        let raw_spec = ModelSpec::tutorial(Response::LookingTime);
        let log_spec = ModelSpec::tutorial(Response::LogLookingTime);
        let raw = fit_with_cache(&sampler, &raw_spec, &data(), &config).unwrap();
        let log_fit = fit_with_cache(&sampler, &log_spec, &data(), &config).unwrap();
        assert_eq!(sampler.calls.get(), 1);
        assert_eq!(raw.formula, log_fit.formula);
    }

    #[test]
    fn largest_seed_is_sampled_once_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit_looking_time.toml");
        let config = SamplerConfig {
            chains: 1,
            seed: Some(u32::MAX),
            cache_file: Some(path.clone()),
            ..SamplerConfig::default()
        };
        let sampler = CountingSampler { calls: Cell::new(0) };
        let spec = ModelSpec::tutorial(Response::LookingTime);

        let fit = fit_with_cache(&sampler, &spec, &data(), &config).unwrap();
        assert_eq!(sampler.calls.get(), 1);
        assert!(path.exists());
        let reused = fit_with_cache(&sampler, &spec, &data(), &config).unwrap();
        assert_eq!(sampler.calls.get(), 1);
        assert_eq!(reused, fit);
    }

    #[test]
    fn without_a_cache_path_every_call_samples() {
        let sampler = CountingSampler { calls: Cell::new(0) };
        let spec = ModelSpec::tutorial(Response::LookingTime);
        let config = SamplerConfig::default();
        fit_with_cache(&sampler, &spec, &data(), &config).unwrap();
        fit_with_cache(&sampler, &spec, &data(), &config).unwrap();
        assert_eq!(sampler.calls.get(), 2);
    }

    #[test]
    fn invalid_config_is_rejected_before_sampling() {
        let sampler = CountingSampler { calls: Cell::new(0) };
        let config = SamplerConfig {
            warmup: 10,
            iter: 10,
            ..SamplerConfig::default()
        };
        let spec = ModelSpec::tutorial(Response::LookingTime);
        let result = fit_with_cache(&sampler, &spec, &data(), &config);
        assert!(matches!(result, Err(FitError::InvalidConfig(_))));
        assert_eq!(sampler.calls.get(), 0);
    }
}
