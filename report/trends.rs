//! Cell means behind the faceted trend plot: looking time against trial
//! number, one panel per age group, one line per trial type.

use crate::data::{AgeGroup, TrialType};
use crate::transform::PreparedTable;
use itertools::Itertools;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct TrendCell {
    pub age_group: AgeGroup,
    pub trial_type: TrialType,
    pub trial_number: u32,
    /// Trials in the cell.
    pub n: usize,
    pub mean_looking_time: f64,
    pub mean_log_looking_time: f64,
}

/// One cell per observed (age group, trial type, trial number), ordered by
/// age band, then trial type with the reference level first, then trial.
pub fn age_group_trends(table: &PreparedTable) -> Vec<TrendCell> {
    let reference = table.reference();
    let mut sums: BTreeMap<(AgeGroup, bool, TrialType, u32), (usize, f64, f64)> = BTreeMap::new();
    for row in table.rows() {
        let obs = &row.observation;
        let key = (
            obs.age_group,
            obs.trial_type != reference,
            obs.trial_type,
            obs.trial_number,
        );
        let entry = sums.entry(key).or_insert((0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += obs.looking_time;
        entry.2 += row.log_looking_time;
    }

    sums.into_iter()
        .map(
            |((age_group, _, trial_type, trial_number), (n, raw, log))| TrendCell {
                age_group,
                trial_type,
                trial_number,
                n,
                mean_looking_time: raw / n as f64,
                mean_log_looking_time: log / n as f64,
            },
        )
        .collect()
}

/// One line per age group and trial type, listing the per-trial means.
pub fn trend_table(cells: &[TrendCell]) -> String {
    cells
        .iter()
        .chunk_by(|cell| (cell.age_group, cell.trial_type))
        .into_iter()
        .map(|((age_group, trial_type), group)| {
            let means = group
                .map(|cell| format!("{}:{:.3}", cell.trial_number, cell.mean_looking_time))
                .join(" ");
            format!("{:<9} {:<4} {means}", age_group.label(), trial_type.label())
        })
        .join("\n")
}
