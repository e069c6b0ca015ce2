//! Declarative model description.
//!
//! A [`ModelSpec`] names the response, the ordered fixed-effect terms, the
//! random-intercept grouping factor and, optionally, one prior per coefficient
//! class. It is data only: fitters read it, nothing here computes.

use crate::transform::PreparedObservation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// Raw looking time in seconds.
    LookingTime,
    /// Natural log of looking time.
    LogLookingTime,
}

impl Response {
    pub fn column_name(self) -> &'static str {
        match self {
            Response::LookingTime => "looking_time",
            Response::LogLookingTime => "log_looking_time",
        }
    }

    pub fn value(self, row: &PreparedObservation) -> f64 {
        match self {
            Response::LookingTime => row.observation.looking_time,
            Response::LogLookingTime => row.log_looking_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedEffect {
    CenteredAge,
    StimulusIndicator,
    /// Centred age times stimulus indicator.
    AgeByStimulus,
}

impl FixedEffect {
    pub fn column_name(self) -> &'static str {
        match self {
            FixedEffect::CenteredAge => "centered_age",
            FixedEffect::StimulusIndicator => "stimulus_indicator",
            FixedEffect::AgeByStimulus => "centered_age:stimulus_indicator",
        }
    }

    pub fn value(self, row: &PreparedObservation) -> f64 {
        let indicator = f64::from(row.stimulus_indicator);
        match self {
            FixedEffect::CenteredAge => row.centered_age,
            FixedEffect::StimulusIndicator => indicator,
            FixedEffect::AgeByStimulus => row.centered_age * indicator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingFactor {
    Subject,
}

impl GroupingFactor {
    pub fn column_name(self) -> &'static str {
        match self {
            GroupingFactor::Subject => "subject_id",
        }
    }
}

/// Coefficient classes a prior can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorClass {
    Intercept,
    /// Every fixed-effect slope.
    #[serde(rename = "b")]
    B,
    /// Residual standard deviation.
    #[serde(rename = "sigma")]
    Sigma,
    /// Standard deviation of the random intercepts.
    #[serde(rename = "sd")]
    Sd,
}

impl fmt::Display for PriorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PriorClass::Intercept => "Intercept",
            PriorClass::B => "b",
            PriorClass::Sigma => "sigma",
            PriorClass::Sd => "sd",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum PriorDistribution {
    Normal { mean: f64, sd: f64 },
    StudentT { df: f64, location: f64, scale: f64 },
    Exponential { rate: f64 },
}

impl PriorDistribution {
    fn validate(&self) -> Result<(), String> {
        let (params, scale): (Vec<f64>, f64) = match *self {
            PriorDistribution::Normal { mean, sd } => (vec![mean, sd], sd),
            PriorDistribution::StudentT {
                df,
                location,
                scale,
            } => {
                if !(df > 0.0) {
                    return Err(format!("degrees of freedom must be positive, got {df}"));
                }
                (vec![df, location, scale], scale)
            }
            PriorDistribution::Exponential { rate } => (vec![rate], rate),
        };
        if params.iter().any(|p| !p.is_finite()) {
            return Err(format!("non-finite parameter in {self}"));
        }
        if !(scale > 0.0) {
            return Err(format!("scale must be positive in {self}"));
        }
        Ok(())
    }
}

impl fmt::Display for PriorDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorDistribution::Normal { mean, sd } => write!(f, "normal({mean}, {sd})"),
            PriorDistribution::StudentT {
                df,
                location,
                scale,
            } => write!(f, "student_t({df}, {location}, {scale})"),
            PriorDistribution::Exponential { rate } => write!(f, "exponential({rate})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub class: PriorClass,
    pub distribution: PriorDistribution,
}

#[derive(Error, Debug, PartialEq)]
pub enum SpecError {
    #[error("A model needs at least one fixed-effect term.")]
    NoFixedEffects,
    #[error("Fixed-effect term '{0}' appears more than once.")]
    DuplicateFixedEffect(&'static str),
    #[error("More than one prior was given for class '{0}'.")]
    DuplicatePrior(PriorClass),
    #[error("Invalid prior for class '{class}': {reason}")]
    InvalidPrior { class: PriorClass, reason: String },
}

#[derive(Error, Debug)]
pub enum SpecFileError {
    #[error("Failed to read or write model spec file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model spec file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model spec to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model spec file is not a valid model: {0}")]
    Invalid(#[from] SpecError),
}

/// The complete description handed to a fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub response: Response,
    /// Fixed-effect terms in declaration order; the intercept is implicit.
    pub fixed_effects: Vec<FixedEffect>,
    pub grouping: GroupingFactor,
    /// At most one prior per class. Empty for a frequentist fit.
    #[serde(default)]
    pub priors: Vec<Prior>,
}

impl ModelSpec {
    pub fn builder(response: Response) -> ModelSpecBuilder {
        ModelSpecBuilder {
            response,
            fixed_effects: Vec::new(),
            grouping: GroupingFactor::Subject,
            priors: Vec::new(),
        }
    }

    /// Age, stimulus and their interaction with a per-subject intercept.
    pub fn tutorial(response: Response) -> Self {
        Self {
            response,
            fixed_effects: vec![
                FixedEffect::CenteredAge,
                FixedEffect::StimulusIndicator,
                FixedEffect::AgeByStimulus,
            ],
            grouping: GroupingFactor::Subject,
            priors: Vec::new(),
        }
    }

    /// Returns a copy carrying `priors`, validated like the builder does.
    pub fn with_priors(&self, priors: &[Prior]) -> Result<Self, SpecError> {
        let mut builder = ModelSpec::builder(self.response).random_intercept(self.grouping);
        for &term in &self.fixed_effects {
            builder = builder.fixed(term);
        }
        for prior in priors {
            builder = builder.prior(prior.class, prior.distribution);
        }
        builder.build()
    }

    pub fn prior_for(&self, class: PriorClass) -> Option<&PriorDistribution> {
        self.priors
            .iter()
            .find(|p| p.class == class)
            .map(|p| &p.distribution)
    }

    pub fn is_bayesian(&self) -> bool {
        !self.priors.is_empty()
    }

    /// Checks the invariants a deserialized spec might violate.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.fixed_effects.is_empty() {
            return Err(SpecError::NoFixedEffects);
        }
        for (i, term) in self.fixed_effects.iter().enumerate() {
            if self.fixed_effects[..i].contains(term) {
                return Err(SpecError::DuplicateFixedEffect(term.column_name()));
            }
        }
        for (i, prior) in self.priors.iter().enumerate() {
            if self.priors[..i].iter().any(|p| p.class == prior.class) {
                return Err(SpecError::DuplicatePrior(prior.class));
            }
            prior
                .distribution
                .validate()
                .map_err(|reason| SpecError::InvalidPrior {
                    class: prior.class,
                    reason,
                })?;
        }
        Ok(())
    }

    /// Saves the model in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), SpecFileError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates a spec from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SpecFileError> {
        let toml_string = fs::read_to_string(path)?;
        let spec: ModelSpec = toml::from_str(&toml_string)?;
        spec.validate()?;
        Ok(spec)
    }
}

impl fmt::Display for ModelSpec {
    /// Renders the formula, e.g.
    /// `looking_time ~ 1 + centered_age + (1 | subject_id)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ 1", self.response.column_name())?;
        for term in &self.fixed_effects {
            write!(f, " + {}", term.column_name())?;
        }
        write!(f, " + (1 | {})", self.grouping.column_name())
    }
}

pub struct ModelSpecBuilder {
    response: Response,
    fixed_effects: Vec<FixedEffect>,
    grouping: GroupingFactor,
    priors: Vec<Prior>,
}

impl ModelSpecBuilder {
    pub fn fixed(mut self, term: FixedEffect) -> Self {
        self.fixed_effects.push(term);
        self
    }

    pub fn random_intercept(mut self, grouping: GroupingFactor) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn prior(mut self, class: PriorClass, distribution: PriorDistribution) -> Self {
        self.priors.push(Prior {
            class,
            distribution,
        });
        self
    }

    pub fn build(self) -> Result<ModelSpec, SpecError> {
        let spec = ModelSpec {
            response: self.response,
            fixed_effects: self.fixed_effects,
            grouping: self.grouping,
            priors: self.priors,
        };
        spec.validate()?;
        Ok(spec)
    }
}
