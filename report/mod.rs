//! # Reporting
//!
//! Formats fitter output for a reader. Plots are out of scope; this module
//! produces the numbers behind them as plain-text tables:
//! - coefficient tables for frequentist fits
//! - posterior summaries for Bayesian fits
//! - cell means behind the faceted age-group trend plot ([`trends`])
//! - posterior-predictive summaries ([`predictive`])
//!
//! Every number in a rendered table is rounded to three decimals.

pub mod predictive;
pub mod trends;

use crate::fit::FrequentistFit;
use crate::fit::posterior::PosteriorFit;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ReportError {
    #[error("Parameter '{0}' is not present in the posterior draws.")]
    MissingParameter(String),
    #[error("Posterior interval probability must lie in (0, 1), got {0}")]
    InvalidProbability(f64),
    #[error("The fit holds no draws.")]
    NoDraws,
}

/// Fixed-effect coefficients with standard errors, test statistics and
/// p-values, followed by the variance components.
pub fn coefficient_table(fit: &FrequentistFit) -> String {
    let mut out = String::new();
    out.push_str(&format!("Formula: {}\n", fit.formula));
    out.push_str(&format!(
        "Observations: {}, groups: {}\n",
        fit.n_obs, fit.n_groups
    ));
    out.push_str(&format!(
        "{:<36} {:>10} {:>10} {:>10} {:>10}\n",
        "term", "estimate", "std.error", "statistic", "p.value"
    ));
    for c in &fit.coefficients {
        let p_value = match c.p_value {
            Some(p) => format!("{p:.3}"),
            None => "NA".to_string(),
        };
        out.push_str(&format!(
            "{:<36} {:>10.3} {:>10.3} {:>10.3} {:>10}\n",
            c.term, c.estimate, c.std_error, c.statistic, p_value
        ));
    }
    out.push_str(&format!("Random intercept sd: {:.3}\n", fit.group_sd));
    out.push_str(&format!("Residual sd: {:.3}\n", fit.residual_sd));
    out
}

/// Marginal summary of one parameter's draws, chains pooled.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub parameter: String,
    pub mean: f64,
    pub sd: f64,
    pub median: f64,
    /// Lower bound of the equal-tailed interval.
    pub lower: f64,
    pub upper: f64,
    pub rhat: f64,
}

/// Summaries of the population-level parameters: fixed effects, residual sd
/// and random-intercept sd. Per-subject intercepts (`r_*`) are left out.
pub fn summarize_posterior(
    fit: &PosteriorFit,
    prob: f64,
) -> Result<Vec<ParameterSummary>, ReportError> {
    let names: Vec<&str> = fit
        .parameters
        .iter()
        .map(String::as_str)
        .filter(|name| !name.starts_with("r_"))
        .collect();
    summarize_parameters(fit, &names, prob)
}

/// Summaries of the named parameters with a central `prob` interval.
pub fn summarize_parameters(
    fit: &PosteriorFit,
    names: &[&str],
    prob: f64,
) -> Result<Vec<ParameterSummary>, ReportError> {
    if !(prob > 0.0 && prob < 1.0) {
        return Err(ReportError::InvalidProbability(prob));
    }
    if fit.n_chains() == 0 || fit.n_draws() == 0 {
        return Err(ReportError::NoDraws);
    }
    let tail = (1.0 - prob) / 2.0;

    names
        .iter()
        .map(|&name| {
            let mut draws = fit
                .draws_of(name)
                .ok_or_else(|| ReportError::MissingParameter(name.to_string()))?;
            draws.sort_by(f64::total_cmp);
            let (mean, sd) = mean_and_sd(&draws);
            Ok(ParameterSummary {
                parameter: name.to_string(),
                mean,
                sd,
                median: quantile(&draws, 0.5),
                lower: quantile(&draws, tail),
                upper: quantile(&draws, 1.0 - tail),
                rhat: fit.rhat_of(name).unwrap_or(f64::NAN),
            })
        })
        .collect()
}

pub fn posterior_table(summaries: &[ParameterSummary], prob: f64) -> String {
    let lower_label = format!("l-{:.0}% CI", prob * 100.0);
    let upper_label = format!("u-{:.0}% CI", prob * 100.0);
    let mut out = String::new();
    out.push_str(&format!(
        "{:<36} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}\n",
        "parameter", "mean", "sd", "median", lower_label, upper_label, "rhat"
    ));
    for s in summaries {
        out.push_str(&format!(
            "{:<36} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>8.3}\n",
            s.parameter, s.mean, s.sd, s.median, s.lower, s.upper, s.rhat
        ));
    }
    out
}

/// Mean and sample standard deviation. The sd is NaN below two values.
pub(crate) fn mean_and_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Linear-interpolation quantile of sorted values (R's type 7).
pub(crate) fn quantile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}
