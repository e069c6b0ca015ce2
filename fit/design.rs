use crate::fit::spec::{FixedEffect, ModelSpec, Response};
use crate::transform::PreparedTable;
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::collections::HashMap;

/// Numeric inputs for a fitter, assembled from a spec and a prepared table.
///
/// Every prepared row becomes one observation. Subjects keep however many
/// trials they have; nothing is padded or balanced.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    pub response: Response,
    /// Column order of `x`, identical to `ModelSpec::fixed_effects`.
    pub terms: Vec<FixedEffect>,
    /// Response vector, length `n_obs`.
    pub y: Array1<f64>,
    /// Fixed-effect design without the intercept column. Shape: [n_obs, n_terms].
    pub x: Array2<f64>,
    /// 1-based index into `group_labels` for each observation.
    pub group: Vec<usize>,
    /// Grouping-factor levels in order of first appearance.
    pub group_labels: Vec<String>,
}

impl ModelData {
    pub fn assemble(spec: &ModelSpec, table: &PreparedTable) -> Self {
        let n_obs = table.len();
        let terms = spec.fixed_effects.clone();

        let y: Array1<f64> = table
            .rows()
            .iter()
            .map(|row| spec.response.value(row))
            .collect();
        let x = Array2::from_shape_fn((n_obs, terms.len()), |(i, j)| {
            terms[j].value(&table.rows()[i])
        });

        let mut lookup: HashMap<&str, usize> = HashMap::new();
        let mut group_labels = Vec::new();
        let mut group = Vec::with_capacity(n_obs);
        for row in table.rows() {
            let label = row.observation.subject_id.as_str();
            let index = *lookup.entry(label).or_insert_with(|| {
                group_labels.push(label.to_string());
                group_labels.len()
            });
            group.push(index);
        }

        log::debug!(
            "Assembled model data: {n_obs} observations, {} terms, {} groups",
            terms.len(),
            group_labels.len()
        );

        Self {
            response: spec.response,
            terms,
            y,
            x,
            group,
            group_labels,
        }
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_groups(&self) -> usize {
        self.group_labels.len()
    }

    /// Number of observations per group, in `group_labels` order.
    pub fn trials_per_group(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_groups()];
        for &g in &self.group {
            counts[g - 1] += 1;
        }
        counts
    }

    /// The data block for a Stan program, as JSON.
    pub fn to_stan_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let rows: Vec<Vec<f64>> = self.x.rows().into_iter().map(|r| r.to_vec()).collect();
        serde_json::to_value(StanData {
            n: self.n_obs(),
            k: self.terms.len(),
            x: rows,
            y: self.y.to_vec(),
            j: self.n_groups(),
            g: &self.group,
        })
    }
}

#[derive(Serialize)]
struct StanData<'a> {
    #[serde(rename = "N")]
    n: usize,
    #[serde(rename = "K")]
    k: usize,
    #[serde(rename = "X")]
    x: Vec<Vec<f64>>,
    #[serde(rename = "Y")]
    y: Vec<f64>,
    #[serde(rename = "J")]
    j: usize,
    g: &'a [usize],
}
