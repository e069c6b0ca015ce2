//! # Data Loading Module
//!
//! Entry point for the trial-level looking-time table. The table is fetched
//! over HTTP(S) or read from a local path, then parsed into a [`RawTable`]
//! where every cell is optional. No filtering happens here: a cell that is
//! empty, `NA`, or holds an unrecognised category level becomes `None` and is
//! dealt with by the clean stage.
//!
//! - All-or-nothing: a transport failure, a missing header column or a
//!   malformed cell aborts the load. There are no partial tables.
//! - Strict schema: column names are fixed (see [`REQUIRED_COLUMNS`]).

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use thiserror::Error;

const HTTP_USER_AGENT: &str = "lookfit-http-client/1.0";

/// Header names the loader requires, in canonical order.
pub const REQUIRED_COLUMNS: [&str; 9] = [
    "subid",
    "lab",
    "method",
    "nae",
    "age_mo",
    "age_group",
    "trial_num",
    "trial_type",
    "looking_time",
];

/// Ordered age bands used to facet the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgeGroup {
    #[serde(rename = "3-6 mo")]
    Months3To6,
    #[serde(rename = "6-9 mo")]
    Months6To9,
    #[serde(rename = "9-12 mo")]
    Months9To12,
    #[serde(rename = "12-15 mo")]
    Months12To15,
}

impl AgeGroup {
    pub const ALL: [AgeGroup; 4] = [
        AgeGroup::Months3To6,
        AgeGroup::Months6To9,
        AgeGroup::Months9To12,
        AgeGroup::Months12To15,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AgeGroup::Months3To6 => "3-6 mo",
            AgeGroup::Months6To9 => "6-9 mo",
            AgeGroup::Months9To12 => "9-12 mo",
            AgeGroup::Months12To15 => "12-15 mo",
        }
    }

    /// Parses a band label. Whitespace around the label and between the
    /// number range and the unit is tolerated (`"3-6mo"`, `" 3-6 mo "`).
    pub fn from_label(label: &str) -> Option<Self> {
        let compact: String = label.chars().filter(|c| !c.is_whitespace()).collect();
        AgeGroup::ALL
            .into_iter()
            .find(|group| group.label().replace(' ', "").eq_ignore_ascii_case(&compact))
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The two stimulus conditions of the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrialType {
    /// Infant-directed speech.
    #[serde(rename = "IDS")]
    Ids,
    /// Adult-directed speech.
    #[serde(rename = "ADS")]
    Ads,
}

impl TrialType {
    pub const ALL: [TrialType; 2] = [TrialType::Ids, TrialType::Ads];

    pub fn label(self) -> &'static str {
        match self {
            TrialType::Ids => "IDS",
            TrialType::Ads => "ADS",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        TrialType::ALL
            .into_iter()
            .find(|level| level.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for TrialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One trial for one subject, exactly as loaded. `None` marks a missing or
/// unusable cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawObservation {
    pub subject_id: Option<String>,
    pub laboratory_id: Option<String>,
    pub method: Option<String>,
    /// North-American-English language group flag.
    pub language_group: Option<bool>,
    pub age_months: Option<f64>,
    pub age_group: Option<AgeGroup>,
    pub trial_number: Option<u32>,
    pub trial_type: Option<TrialType>,
    pub looking_time: Option<f64>,
}

/// The loaded observation table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub rows: Vec<RawObservation>,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Where the table comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Url(String),
    Path(PathBuf),
}

impl DataSource {
    /// `http://` and `https://` locations are fetched; anything else is a
    /// local path.
    pub fn parse(location: &str) -> Self {
        let trimmed = location.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            DataSource::Url(trimmed.to_string())
        } else {
            DataSource::Path(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Url(url) => f.write_str(url),
            DataSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Failures while obtaining or decoding the table.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },
    #[error("Failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed table: {0}")]
    Parse(#[from] ParseError),
}

/// Malformed tabular encoding.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the header. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("row {row}, column '{column}': '{value}' is not a valid {expected}")]
    InvalidCell {
        row: usize,
        column: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Loads the full table from `source`.
pub fn load_table(source: &DataSource) -> Result<RawTable, DataError> {
    let table = match source {
        DataSource::Url(url) => {
            log::info!("Fetching observation table from {url}");
            let body = fetch_url(url)?;
            parse_table(body.as_slice())?
        }
        DataSource::Path(path) => {
            log::info!("Reading observation table from {}", path.display());
            let file = File::open(path).map_err(|source| DataError::Io {
                path: path.clone(),
                source,
            })?;
            parse_table(BufReader::new(file))?
        }
    };
    log::info!("Loaded {} rows from {source}", table.len());
    Ok(table)
}

fn fetch_url(url: &str) -> Result<Vec<u8>, DataError> {
    let fetch_error = |reason: String| DataError::Fetch {
        url: url.to_string(),
        reason,
    };

    let client = Client::builder()
        .user_agent(HTTP_USER_AGENT)
        .build()
        .map_err(|e| fetch_error(format!("failed to build HTTP client: {e}")))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| fetch_error(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_error(format!("HTTP {status}")));
    }

    let body = response
        .bytes()
        .map_err(|e| fetch_error(format!("failed to read response body: {e}")))?;
    log::debug!("Fetched {} bytes from {url}", body.len());
    Ok(body.to_vec())
}

/// Parses a delimited table from any reader.
pub fn parse_table<R: Read>(input: R) -> Result<RawTable, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);

    let columns = ColumnIndex::from_headers(reader.headers()?)?;

    let mut rows = Vec::new();
    let mut unrecognised_levels = 0usize;
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        // 1-based data row, header excluded.
        let (row, unrecognised) = columns.parse_record(&record, i + 1)?;
        unrecognised_levels += unrecognised;
        rows.push(row);
    }

    if unrecognised_levels > 0 {
        log::debug!(
            "{unrecognised_levels} categorical cells held unrecognised levels and were read as missing"
        );
    }
    Ok(RawTable { rows })
}

/// Positions of the required columns within a header row.
struct ColumnIndex {
    positions: [usize; REQUIRED_COLUMNS.len()],
}

impl ColumnIndex {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, ParseError> {
        let mut positions = [0usize; REQUIRED_COLUMNS.len()];
        for (slot, name) in positions.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| ParseError::ColumnNotFound(name.to_string()))?;
        }
        Ok(Self { positions })
    }

    fn cell<'r>(&self, record: &'r csv::StringRecord, column: usize) -> Option<&'r str> {
        record
            .get(self.positions[column])
            .filter(|value| !is_missing(value))
    }

    /// Returns the parsed row and the number of categorical cells whose level
    /// was not recognised.
    fn parse_record(
        &self,
        record: &csv::StringRecord,
        row: usize,
    ) -> Result<(RawObservation, usize), ParseError> {
        let text = |column: usize| self.cell(record, column).map(str::to_string);

        let language_group = self
            .cell(record, 3)
            .map(|v| parse_bool(v).ok_or_else(|| invalid(row, 3, v, "boolean")))
            .transpose()?;
        let age_months = self
            .cell(record, 4)
            .map(|v| v.parse::<f64>().map_err(|_| invalid(row, 4, v, "number")))
            .transpose()?;
        let trial_number = self
            .cell(record, 6)
            .map(|v| v.parse::<u32>().map_err(|_| invalid(row, 6, v, "trial number")))
            .transpose()?;
        let looking_time = self
            .cell(record, 8)
            .map(|v| v.parse::<f64>().map_err(|_| invalid(row, 8, v, "number")))
            .transpose()?;

        let age_group_cell = self.cell(record, 5);
        let trial_type_cell = self.cell(record, 7);
        let age_group = age_group_cell.and_then(AgeGroup::from_label);
        let trial_type = trial_type_cell.and_then(TrialType::from_label);
        let unrecognised = usize::from(age_group_cell.is_some() && age_group.is_none())
            + usize::from(trial_type_cell.is_some() && trial_type.is_none());

        let observation = RawObservation {
            subject_id: text(0),
            laboratory_id: text(1),
            method: text(2),
            language_group,
            age_months,
            age_group,
            trial_number,
            trial_type,
            looking_time,
        };
        Ok((observation, unrecognised))
    }
}

fn invalid(row: usize, column: usize, value: &str, expected: &'static str) -> ParseError {
    ParseError::InvalidCell {
        row,
        column: REQUIRED_COLUMNS[column],
        value: value.to_string(),
        expected,
    }
}

fn is_missing(value: &str) -> bool {
    value.is_empty() || value == "NA" || value == "N/A"
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}
