//! Derived columns for the model: centred age, log looking time and the
//! stimulus indicator.
//!
//! The transform is a pure function of the clean table. Running it twice on
//! the same rows yields identical output.

use crate::clean::{CleanTable, Observation};
use crate::data::TrialType;
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TransformError {
    #[error(
        "Row {row} (subject '{subject_id}') has looking time {value}; the log transform requires strictly positive values."
    )]
    NonPositiveLookingTime {
        row: usize,
        subject_id: String,
        value: f64,
    },
    #[error("Cannot centre age on an empty table.")]
    EmptyTable,
}

/// A clean row together with its derived columns.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedObservation {
    pub observation: Observation,
    /// `age_months` minus the table-wide mean age.
    pub centered_age: f64,
    pub log_looking_time: f64,
    /// 1 for trials of the reference level, 0 otherwise.
    pub stimulus_indicator: u8,
}

/// The model-ready table. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTable {
    rows: Vec<PreparedObservation>,
    age_mean: f64,
    reference: TrialType,
}

impl PreparedTable {
    pub fn rows(&self) -> &[PreparedObservation] {
        &self.rows
    }

    /// Mean age over the clean rows, the centring constant.
    pub fn age_mean(&self) -> f64 {
        self.age_mean
    }

    pub fn reference(&self) -> TrialType {
        self.reference
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The clean rows this table was derived from.
    pub fn base(&self) -> CleanTable {
        CleanTable::from_rows(self.rows.iter().map(|r| r.observation.clone()).collect())
    }

    /// Writes the table, derived columns included, as CSV. The first nine
    /// columns use the loader's header names so the file can be loaded back.
    pub fn write_csv<W: Write>(&self, out: W) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_writer(out);
        for row in &self.rows {
            let obs = &row.observation;
            writer.serialize(PreparedRecord {
                subid: &obs.subject_id,
                lab: &obs.laboratory_id,
                method: &obs.method,
                nae: if obs.language_group { "TRUE" } else { "FALSE" },
                age_mo: obs.age_months,
                age_group: obs.age_group.label(),
                trial_num: obs.trial_number,
                trial_type: obs.trial_type.label(),
                looking_time: obs.looking_time,
                centered_age: row.centered_age,
                log_looking_time: row.log_looking_time,
                stimulus_indicator: row.stimulus_indicator,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PreparedRecord<'a> {
    subid: &'a str,
    lab: &'a str,
    method: &'a str,
    nae: &'static str,
    age_mo: f64,
    age_group: &'static str,
    trial_num: u32,
    trial_type: &'static str,
    looking_time: f64,
    centered_age: f64,
    log_looking_time: f64,
    stimulus_indicator: u8,
}

/// Derives the model columns for every row of `table`.
///
/// Fails closed: a single non-positive or non-finite looking time rejects the
/// whole table.
pub fn transform(table: &CleanTable, reference: TrialType) -> Result<PreparedTable, TransformError> {
    if table.is_empty() {
        return Err(TransformError::EmptyTable);
    }

    for (i, obs) in table.rows().iter().enumerate() {
        if !(obs.looking_time > 0.0 && obs.looking_time.is_finite()) {
            return Err(TransformError::NonPositiveLookingTime {
                row: i + 1,
                subject_id: obs.subject_id.clone(),
                value: obs.looking_time,
            });
        }
    }

    let age_mean =
        table.rows().iter().map(|obs| obs.age_months).sum::<f64>() / table.len() as f64;

    let rows = table
        .rows()
        .iter()
        .map(|obs| PreparedObservation {
            observation: obs.clone(),
            centered_age: obs.age_months - age_mean,
            log_looking_time: obs.looking_time.ln(),
            stimulus_indicator: u8::from(obs.trial_type == reference),
        })
        .collect();

    log::info!(
        "Derived model columns for {} rows (mean age {age_mean:.3} months, reference level {reference})",
        table.len()
    );

    Ok(PreparedTable {
        rows,
        age_mean,
        reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::{CleanFilter, clean};
    use crate::data::{AgeGroup, parse_table};
    use approx::assert_abs_diff_eq;

    fn obs(subject: &str, age: f64, trial_type: TrialType, looking_time: f64) -> Observation {
        Observation {
            subject_id: subject.to_string(),
            laboratory_id: "lab1".to_string(),
            method: "singlescreen".to_string(),
            language_group: true,
            age_months: age,
            age_group: AgeGroup::Months6To9,
            trial_number: 1,
            trial_type,
            looking_time,
        }
    }

    fn sample_table() -> CleanTable {
        CleanTable::from_rows(vec![
            obs("a", 6.5, TrialType::Ids, 8.0),
            obs("a", 6.5, TrialType::Ads, 4.0),
            obs("b", 11.0, TrialType::Ids, 12.5),
            obs("c", 3.2, TrialType::Ads, 2.0),
        ])
    }

    #[test]
    fn centred_age_sums_to_zero() {
        let prepared = transform(&sample_table(), TrialType::Ids).unwrap();
        let total: f64 = prepared.rows().iter().map(|r| r.centered_age).sum();
        assert_abs_diff_eq!(total, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.age_mean(), (6.5 + 6.5 + 11.0 + 3.2) / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn log_looking_time_matches_ln() {
        let prepared = transform(&sample_table(), TrialType::Ids).unwrap();
        for row in prepared.rows() {
            assert_eq!(row.log_looking_time, row.observation.looking_time.ln());
        }
    }

    #[test]
    fn stimulus_indicator_marks_reference_level_only() {
        for reference in TrialType::ALL {
            let prepared = transform(&sample_table(), reference).unwrap();
            for row in prepared.rows() {
                let expected = u8::from(row.observation.trial_type == reference);
                assert_eq!(row.stimulus_indicator, expected);
            }
            let ones = prepared
                .rows()
                .iter()
                .filter(|r| r.stimulus_indicator == 1)
                .count();
            assert_eq!(ones, 2);
        }
    }

    #[test]
    fn non_positive_looking_time_fails_closed() {
        for bad in [0.0, -1.5, f64::NAN] {
            let table = CleanTable::from_rows(vec![
                obs("a", 6.0, TrialType::Ids, 3.0),
                obs("b", 7.0, TrialType::Ads, bad),
            ]);
            match transform(&table, TrialType::Ids) {
                Err(TransformError::NonPositiveLookingTime { row, subject_id, .. }) => {
                    assert_eq!(row, 2);
                    assert_eq!(subject_id, "b");
                }
                other => panic!("expected NonPositiveLookingTime for {bad}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_table_is_rejected() {
        assert_eq!(
            transform(&CleanTable::default(), TrialType::Ids),
            Err(TransformError::EmptyTable)
        );
    }

    #[test]
    fn transform_is_a_fixed_point_on_its_base() {
        let prepared = transform(&sample_table(), TrialType::Ids).unwrap();
        let again = transform(&prepared.base(), TrialType::Ids).unwrap();
        assert_eq!(prepared, again);
    }

    #[test]
    fn exported_csv_reloads_to_the_same_clean_rows() {
        let prepared = transform(&sample_table(), TrialType::Ids).unwrap();
        let mut buffer = Vec::new();
        prepared.write_csv(&mut buffer).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("subid,lab,method,nae,age_mo,age_group,trial_num,trial_type,looking_time,centered_age"));

        let reloaded = parse_table(buffer.as_slice()).unwrap();
        assert_eq!(clean(&reloaded, &CleanFilter::default()), prepared.base());
    }
}
