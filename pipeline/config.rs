//! Pipeline configuration file.
//!
//! Every field is optional in TOML; omitted fields take the tutorial values.
//!
//! ```toml
//! source = "data/03_data_trial_main.csv"
//! response = "log_looking_time"
//!
//! [filter]
//! method = "singlescreen"
//!
//! [sampler]
//! seed = 42
//! cache_file = "models/fit.toml"   # stored as models/fit_log_looking_time.toml
//!
//! [[priors]]
//! class = "sigma"
//! distribution = { family = "exponential", rate = 1.0 }
//! ```

use crate::clean::CleanFilter;
use crate::data::{DataSource, TrialType};
use crate::fit::FitError;
use crate::fit::posterior::SamplerConfig;
use crate::fit::spec::{ModelSpec, Prior, PriorClass, PriorDistribution, Response, SpecError};
use crate::fit::stan::detect_cmdstan;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Processed ManyBabies 1 trial-level table.
pub const DEFAULT_SOURCE: &str = "https://raw.githubusercontent.com/manybabies/mb1-analysis-public/master/processed_data/03_data_trial_main.csv";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid sampler settings in config: {0}")]
    Sampler(String),
    #[error("Invalid priors in config: {0}")]
    Priors(#[from] SpecError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// URL or local path of the trial table.
    pub source: String,
    pub filter: CleanFilter,
    /// Trial type coded as `stimulus_indicator = 1`.
    pub reference_level: TrialType,
    pub response: Response,
    pub sampler: SamplerConfig,
    /// `None` selects [`tutorial_priors`] for the response. An explicit empty
    /// list leaves the location parameters flat.
    pub priors: Option<Vec<Prior>>,
    /// CmdStan installation. Falls back to the `CMDSTAN` environment variable.
    pub cmdstan: Option<PathBuf>,
    /// Where Stan programs, data files and chain output are written.
    pub work_dir: PathBuf,
    /// Directory of the per-response fit caches when no `cache_file` is set.
    pub cache_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            filter: CleanFilter::default(),
            reference_level: TrialType::Ids,
            response: Response::LookingTime,
            sampler: SamplerConfig::default(),
            priors: None,
            cmdstan: None,
            work_dir: PathBuf::from("stan_work"),
            cache_dir: PathBuf::from("models"),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        log::debug!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampler.validate().map_err(ConfigError::Sampler)?;
        self.model_spec()?;
        Ok(())
    }

    pub fn data_source(&self) -> DataSource {
        DataSource::parse(&self.source)
    }

    /// The tutorial model for the configured response, with priors attached.
    pub fn model_spec(&self) -> Result<ModelSpec, SpecError> {
        let priors = match &self.priors {
            Some(priors) => priors.clone(),
            None => tutorial_priors(self.response),
        };
        ModelSpec::tutorial(self.response).with_priors(&priors)
    }

    /// Sampler settings with the cache path keyed by the configured response.
    ///
    /// Without a `cache_file` the fit lives at `cache_dir/fit_<response>.toml`.
    /// A configured `cache_file` gets `_<response>` appended to its stem, so the
    /// raw and log models never share a file.
    pub fn sampler_for_response(&self) -> SamplerConfig {
        let column = self.response.column_name();
        let cache_file = match &self.sampler.cache_file {
            Some(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "fit".to_string());
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "toml".to_string());
                path.with_file_name(format!("{stem}_{column}.{ext}"))
            }
            None => self.cache_dir.join(format!("fit_{column}.toml")),
        };
        SamplerConfig {
            cache_file: Some(cache_file),
            ..self.sampler.clone()
        }
    }

    pub fn cmdstan_home(&self) -> Result<PathBuf, FitError> {
        match &self.cmdstan {
            Some(path) => Ok(path.clone()),
            None => detect_cmdstan(),
        }
    }
}

/// Weakly informative priors on the scale of each response.
pub fn tutorial_priors(response: Response) -> Vec<Prior> {
    let normal = |mean, sd| PriorDistribution::Normal { mean, sd };
    let (intercept, slope, scale) = match response {
        Response::LookingTime => (normal(10.0, 5.0), normal(0.0, 2.0), normal(0.0, 5.0)),
        Response::LogLookingTime => (normal(2.0, 1.0), normal(0.0, 0.5), normal(0.0, 1.0)),
    };
    vec![
        Prior {
            class: PriorClass::Intercept,
            distribution: intercept,
        },
        Prior {
            class: PriorClass::B,
            distribution: slope,
        },
        Prior {
            class: PriorClass::Sigma,
            distribution: scale,
        },
        Prior {
            class: PriorClass::Sd,
            distribution: scale,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_gives_tutorial_defaults() {
        let file = write_config("");
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.data_source(), DataSource::Url(DEFAULT_SOURCE.to_string()));
        assert_eq!(config.sampler.adapt_delta, 0.99);

        let spec = config.model_spec().unwrap();
        assert_eq!(spec.priors, tutorial_priors(Response::LookingTime));
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let file = write_config(
            r#"
source = "local/trials.csv"
response = "log_looking_time"
reference_level = "ADS"

[filter]
language_group = false

[sampler]
chains = 2
seed = 11

[[priors]]
class = "sigma"
distribution = { family = "exponential", rate = 1.0 }
"#,
        );
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.data_source(), DataSource::Path(PathBuf::from("local/trials.csv")));
        assert_eq!(config.reference_level, TrialType::Ads);
        assert_eq!(config.filter.method, "singlescreen");
        assert!(!config.filter.language_group);
        assert_eq!(config.sampler.chains, 2);
        assert_eq!(config.sampler.seed, Some(11));
        assert_eq!(config.sampler.iter, 2000);

        let spec = config.model_spec().unwrap();
        assert_eq!(spec.response, Response::LogLookingTime);
        assert_eq!(spec.priors.len(), 1);
        assert_eq!(
            spec.prior_for(PriorClass::Sigma),
            Some(&PriorDistribution::Exponential { rate: 1.0 })
        );
    }

    #[test]
    fn explicit_empty_priors_stay_empty() {
        let file = write_config("priors = []\n");
        let spec = PipelineConfig::load(file.path()).unwrap().model_spec().unwrap();
        assert!(!spec.is_bayesian());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = write_config("[sampler]\nwarmup = 3000\n");
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(ConfigError::Sampler(_))
        ));

        let file = write_config(
            "[[priors]]\nclass = \"b\"\ndistribution = { family = \"normal\", mean = 0.0, sd = -1.0 }\n",
        );
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(ConfigError::Priors(SpecError::InvalidPrior { .. }))
        ));

        let file = write_config("source = [1, 2]\n");
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let err = PipelineConfig::load(Path::new("/nonexistent/lookfit.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lookfit.toml"));
    }

    #[test]
    fn default_cache_paths_differ_per_response() {
        let raw = PipelineConfig::default();
        let log = PipelineConfig {
            response: Response::LogLookingTime,
            ..PipelineConfig::default()
        };
        assert_eq!(
            raw.sampler_for_response().cache_file,
            Some(PathBuf::from("models/fit_looking_time.toml"))
        );
        assert_eq!(
            log.sampler_for_response().cache_file,
            Some(PathBuf::from("models/fit_log_looking_time.toml"))
        );
    }

    #[test]
    fn configured_cache_file_is_keyed_by_response() {
        let file = write_config(
            "cache_dir = \"ignored\"\n[sampler]\nseed = 3\ncache_file = \"out/fit.toml\"\n",
        );
        let mut config = PipelineConfig::load(file.path()).unwrap();
        let raw = config.sampler_for_response();
        config.response = Response::LogLookingTime;
        let log = config.sampler_for_response();

        assert_eq!(raw.cache_file, Some(PathBuf::from("out/fit_looking_time.toml")));
        assert_eq!(log.cache_file, Some(PathBuf::from("out/fit_log_looking_time.toml")));
        assert_eq!(raw.seed, Some(3));
        assert_eq!(config.sampler.cache_file, Some(PathBuf::from("out/fit.toml")));
    }

    #[test]
    fn seed_beyond_32_bits_is_a_parse_error() {
        let file = write_config("[sampler]\nseed = 18446744073709551615\n");
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(ConfigError::TomlParseError(_))
        ));
        let file = write_config("[sampler]\nseed = 4294967296\n");
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn configured_cmdstan_home_wins() {
        let config = PipelineConfig {
            cmdstan: Some(PathBuf::from("/opt/cmdstan")),
            ..PipelineConfig::default()
        };
        assert_eq!(config.cmdstan_home().unwrap(), PathBuf::from("/opt/cmdstan"));
    }

    #[test]
    fn tutorial_priors_validate_for_both_responses() {
        for response in [Response::LookingTime, Response::LogLookingTime] {
            let spec = ModelSpec::tutorial(response)
                .with_priors(&tutorial_priors(response))
                .unwrap();
            assert!(spec.validate().is_ok());
            assert_eq!(spec.priors.len(), 4);
        }
    }
}
