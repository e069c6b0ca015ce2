//! Row selection and missing-data exclusion.
//!
//! Cleaning keeps the rows that match the procedure and language-group
//! predicates and have a usable value in every column. Incomplete rows are
//! dropped, never imputed. Subjects with fewer trials than others are kept:
//! unbalanced trial counts are left for the mixed model to absorb at fit time.

use crate::data::{AgeGroup, RawObservation, RawTable, TrialType};
use serde::{Deserialize, Serialize};

/// The two fixed predicates applied to every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanFilter {
    /// Experimental procedure identifier, e.g. `singlescreen`.
    pub method: String,
    /// Required value of the language-group flag.
    pub language_group: bool,
}

impl Default for CleanFilter {
    fn default() -> Self {
        Self {
            method: "singlescreen".to_string(),
            language_group: true,
        }
    }
}

/// A complete row: every column present and usable.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub subject_id: String,
    pub laboratory_id: String,
    pub method: String,
    pub language_group: bool,
    pub age_months: f64,
    pub age_group: AgeGroup,
    pub trial_number: u32,
    pub trial_type: TrialType,
    pub looking_time: f64,
}

impl Observation {
    /// Returns `None` when any cell is missing or a numeric cell is not finite.
    ///
    /// A non-positive looking time is still a usable value here; the log
    /// transform is what rejects it.
    pub fn from_raw(raw: &RawObservation) -> Option<Self> {
        let age_months = raw.age_months.filter(|v| v.is_finite())?;
        let looking_time = raw.looking_time.filter(|v| v.is_finite())?;
        Some(Self {
            subject_id: raw.subject_id.clone()?,
            laboratory_id: raw.laboratory_id.clone()?,
            method: raw.method.clone()?,
            language_group: raw.language_group?,
            age_months,
            age_group: raw.age_group?,
            trial_number: raw.trial_number?,
            trial_type: raw.trial_type?,
            looking_time,
        })
    }

    pub fn to_raw(&self) -> RawObservation {
        RawObservation {
            subject_id: Some(self.subject_id.clone()),
            laboratory_id: Some(self.laboratory_id.clone()),
            method: Some(self.method.clone()),
            language_group: Some(self.language_group),
            age_months: Some(self.age_months),
            age_group: Some(self.age_group),
            trial_number: Some(self.trial_number),
            trial_type: Some(self.trial_type),
            looking_time: Some(self.looking_time),
        }
    }
}

/// The filtered, complete table. Row order follows the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanTable {
    rows: Vec<Observation>,
}

impl CleanTable {
    pub fn from_rows(rows: Vec<Observation>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Re-expresses the table with optional cells, so it can be fed back
    /// through [`clean`].
    pub fn to_raw(&self) -> RawTable {
        RawTable {
            rows: self.rows.iter().map(Observation::to_raw).collect(),
        }
    }
}

/// Row counts per outcome of a clean pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub kept: usize,
    pub wrong_method: usize,
    pub wrong_language_group: usize,
    pub incomplete: usize,
}

impl CleanSummary {
    pub fn dropped(&self) -> usize {
        self.wrong_method + self.wrong_language_group + self.incomplete
    }
}

/// Applies `filter` and drops incomplete rows.
pub fn clean(raw: &RawTable, filter: &CleanFilter) -> CleanTable {
    clean_with_summary(raw, filter).0
}

/// Same as [`clean`], also returning how many rows were dropped and why.
pub fn clean_with_summary(raw: &RawTable, filter: &CleanFilter) -> (CleanTable, CleanSummary) {
    let mut summary = CleanSummary::default();
    let mut rows = Vec::with_capacity(raw.len());

    for row in &raw.rows {
        if row.method.as_deref() != Some(filter.method.as_str()) {
            summary.wrong_method += 1;
            continue;
        }
        if row.language_group != Some(filter.language_group) {
            summary.wrong_language_group += 1;
            continue;
        }
        match Observation::from_raw(row) {
            Some(observation) => rows.push(observation),
            None => summary.incomplete += 1,
        }
    }
    summary.kept = rows.len();

    log::debug!(
        "Clean stage drops: method != '{}': {}, language group != {}: {}, incomplete: {}",
        filter.method,
        summary.wrong_method,
        filter.language_group,
        summary.wrong_language_group,
        summary.incomplete
    );
    log::info!(
        "Kept {} of {} rows after cleaning ({} dropped)",
        summary.kept,
        raw.len(),
        summary.dropped()
    );

    (CleanTable { rows }, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_row(subject: &str, method: &str, nae: bool, looking_time: Option<f64>) -> RawObservation {
        RawObservation {
            subject_id: Some(subject.to_string()),
            laboratory_id: Some("lab1".to_string()),
            method: Some(method.to_string()),
            language_group: Some(nae),
            age_months: Some(7.0),
            age_group: Some(AgeGroup::Months6To9),
            trial_number: Some(1),
            trial_type: Some(TrialType::Ids),
            looking_time,
        }
    }

    #[test]
    fn keeps_only_matching_complete_rows() {
        let raw = RawTable {
            rows: vec![
                raw_row("a", "singlescreen", true, Some(5.0)),
                raw_row("b", "hpp", true, Some(5.0)),
                raw_row("c", "singlescreen", false, Some(5.0)),
                raw_row("d", "singlescreen", true, None),
                RawObservation {
                    age_group: None,
                    ..raw_row("e", "singlescreen", true, Some(3.0))
                },
            ],
        };
        let filter = CleanFilter::default();
        let (table, summary) = clean_with_summary(&raw, &filter);

        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].subject_id, "a");
        assert_eq!(
            summary,
            CleanSummary {
                kept: 1,
                wrong_method: 1,
                wrong_language_group: 1,
                incomplete: 2,
            }
        );

        for row in table.rows() {
            assert_eq!(row.method, filter.method);
            assert_eq!(row.language_group, filter.language_group);
        }
    }

    #[test]
    fn non_finite_numbers_are_unusable() {
        let raw = RawTable {
            rows: vec![
                raw_row("a", "singlescreen", true, Some(f64::NAN)),
                RawObservation {
                    age_months: Some(f64::INFINITY),
                    ..raw_row("b", "singlescreen", true, Some(4.0))
                },
            ],
        };
        assert!(clean(&raw, &CleanFilter::default()).is_empty());
    }

    #[test]
    fn non_positive_looking_time_survives_cleaning() {
        let raw = RawTable {
            rows: vec![raw_row("a", "singlescreen", true, Some(0.0))],
        };
        assert_eq!(clean(&raw, &CleanFilter::default()).len(), 1);
    }

    #[test]
    fn cleaning_is_idempotent() {
        let raw = RawTable {
            rows: vec![
                raw_row("a", "singlescreen", true, Some(5.0)),
                raw_row("a", "singlescreen", true, Some(6.0)),
                raw_row("b", "hpp", true, Some(5.0)),
                raw_row("c", "singlescreen", true, None),
            ],
        };
        let filter = CleanFilter::default();
        let once = clean(&raw, &filter);
        let twice = clean(&once.to_raw(), &filter);
        assert_eq!(once, twice);
    }

    #[test]
    fn unbalanced_subjects_are_not_dropped() {
        let mut rows = vec![raw_row("a", "singlescreen", true, Some(5.0))];
        for trial in 1..=4 {
            rows.push(RawObservation {
                trial_number: Some(trial),
                ..raw_row("b", "singlescreen", true, Some(6.0))
            });
        }
        let table = clean(&RawTable { rows }, &CleanFilter::default());
        let subject_a = table.rows().iter().filter(|r| r.subject_id == "a").count();
        let subject_b = table.rows().iter().filter(|r| r.subject_id == "b").count();
        assert_eq!((subject_a, subject_b), (1, 4));
    }
}
