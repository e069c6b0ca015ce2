//! Posterior-predictive checks.
//!
//! Replicated responses are simulated from a subset of posterior draws as
//! `y_rep = b_Intercept + X * b + r[subject] + sigma * z`, with `z` standard
//! normal. Each summary statistic of the observed response is compared with
//! its distribution over the replicates.

use crate::fit::design::ModelData;
use crate::fit::posterior::PosteriorFit;
use crate::fit::spec::GroupingFactor;
use crate::report::{ReportError, mean_and_sd, quantile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Mean,
    Sd,
    Q05,
    Median,
    Q95,
}

impl Statistic {
    pub const ALL: [Statistic; 5] = [
        Statistic::Mean,
        Statistic::Sd,
        Statistic::Q05,
        Statistic::Median,
        Statistic::Q95,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Sd => "sd",
            Statistic::Q05 => "q05",
            Statistic::Median => "median",
            Statistic::Q95 => "q95",
        }
    }

    /// `sorted` must be in ascending order.
    fn compute(self, sorted: &[f64]) -> f64 {
        match self {
            Statistic::Mean => mean_and_sd(sorted).0,
            Statistic::Sd => mean_and_sd(sorted).1,
            Statistic::Q05 => quantile(sorted, 0.05),
            Statistic::Median => quantile(sorted, 0.5),
            Statistic::Q95 => quantile(sorted, 0.95),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticCheck {
    pub statistic: Statistic,
    pub observed: f64,
    /// Mean of the statistic over replicates.
    pub replicated_mean: f64,
    /// Central 95% range of the statistic over replicates.
    pub replicated_lower: f64,
    pub replicated_upper: f64,
    /// Share of replicates whose statistic is at least the observed one.
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveCheck {
    pub n_replicates: usize,
    pub seed: u64,
    pub checks: Vec<StatisticCheck>,
}

impl PredictiveCheck {
    pub fn check_for(&self, statistic: Statistic) -> Option<&StatisticCheck> {
        self.checks.iter().find(|c| c.statistic == statistic)
    }

    pub fn to_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Posterior predictive check ({} replicates, seed {})\n",
            self.n_replicates, self.seed
        ));
        out.push_str(&format!(
            "{:<8} {:>10} {:>10} {:>10} {:>10} {:>8}\n",
            "stat", "observed", "rep.mean", "rep.lower", "rep.upper", "p"
        ));
        for c in &self.checks {
            out.push_str(&format!(
                "{:<8} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>8.3}\n",
                c.statistic.name(),
                c.observed,
                c.replicated_mean,
                c.replicated_lower,
                c.replicated_upper,
                c.p_value
            ));
        }
        out
    }
}

/// Column index in `fit.draws` for every parameter the linear predictor needs.
struct ParameterColumns {
    intercept: usize,
    slopes: Vec<usize>,
    sigma: usize,
    /// Indexed like `ModelData::group_labels`.
    group_effects: Vec<usize>,
}

impl ParameterColumns {
    fn resolve(fit: &PosteriorFit, data: &ModelData) -> Result<Self, ReportError> {
        let index = |name: String| {
            fit.parameter_index(&name)
                .ok_or(ReportError::MissingParameter(name))
        };
        let grouping = GroupingFactor::Subject.column_name();
        Ok(Self {
            intercept: index("b_Intercept".to_string())?,
            slopes: data
                .terms
                .iter()
                .map(|term| index(format!("b_{}", term.column_name())))
                .collect::<Result<_, _>>()?,
            sigma: index("sigma".to_string())?,
            group_effects: data
                .group_labels
                .iter()
                .map(|label| index(format!("r_{grouping}[{label},Intercept]")))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Simulates `n_replicates` replicated data sets, each from one posterior
/// draw. Draws are taken evenly spaced over all chains; if fewer draws exist
/// than requested, every draw is used once.
pub fn posterior_predictive(
    fit: &PosteriorFit,
    data: &ModelData,
    n_replicates: usize,
    seed: u64,
) -> Result<PredictiveCheck, ReportError> {
    let per_chain = fit.n_draws();
    let total = fit.n_chains() * per_chain;
    if total == 0 || n_replicates == 0 || data.n_obs() == 0 {
        return Err(ReportError::NoDraws);
    }
    let columns = ParameterColumns::resolve(fit, data)?;
    let n_replicates = n_replicates.min(total);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut observed = data.y.to_vec();
    observed.sort_by(f64::total_cmp);

    let mut replicated: Vec<Vec<f64>> = vec![Vec::with_capacity(n_replicates); Statistic::ALL.len()];
    let mut y_rep = vec![0.0; data.n_obs()];
    for r in 0..n_replicates {
        let pooled = r * total / n_replicates;
        let draw = fit.draws.slice(ndarray::s![pooled / per_chain, pooled % per_chain, ..]);

        for (i, value) in y_rep.iter_mut().enumerate() {
            let slopes: f64 = columns
                .slopes
                .iter()
                .enumerate()
                .map(|(k, &col)| draw[col] * data.x[[i, k]])
                .sum();
            let mu = draw[columns.intercept] + slopes + draw[columns.group_effects[data.group[i] - 1]];
            let z: f64 = rng.sample(StandardNormal);
            *value = mu + draw[columns.sigma] * z;
        }
        y_rep.sort_by(f64::total_cmp);
        for (slot, statistic) in replicated.iter_mut().zip(Statistic::ALL) {
            slot.push(statistic.compute(&y_rep));
        }
    }

    let checks = Statistic::ALL
        .into_iter()
        .zip(replicated)
        .map(|(statistic, mut values)| {
            let observed = statistic.compute(&observed);
            let exceed = values.iter().filter(|&&v| v >= observed).count();
            values.sort_by(f64::total_cmp);
            StatisticCheck {
                statistic,
                observed,
                replicated_mean: mean_and_sd(&values).0,
                replicated_lower: quantile(&values, 0.025),
                replicated_upper: quantile(&values, 0.975),
                p_value: exceed as f64 / values.len() as f64,
            }
        })
        .collect();

    log::debug!("Simulated {n_replicates} posterior predictive replicates");
    Ok(PredictiveCheck {
        n_replicates,
        seed,
        checks,
    })
}
