//! delimited-text loader for patient tables
//!
//! required columns are looked up by header name (any order). rows with a
//! missing required value are dropped, never imputed; rows whose values are
//! present but unusable (including bytes that aren't valid UTF-8) are dropped
//! the same way. both are counted in [`Dataset::dropped_rows`].

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::StringRecord;
use tracing::{debug, info, warn};

use crate::error::{Result, SurvivalError};
use crate::record::{Dataset, PatientRecord, REQUIRED_COLUMNS};

/// tokens treated as "no value" (compared case-insensitively)
const MISSING_TOKENS: [&str; 7] = ["", "na", "n/a", "#n/a", "nan", "null", "none"];

/// load a comma-separated file from disk
pub fn load_path(path: impl AsRef<Path>) -> Result<Dataset> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading patient table");
    let file = File::open(path)?;
    load_reader(BufReader::new(file))
}

/// load comma-separated data from any byte stream
pub fn load_reader<R: Read>(reader: R) -> Result<Dataset> {
    load_reader_with(reader, b',')
}

/// load delimited data with a custom delimiter (e.g. `b'\t'`)
pub fn load_reader_with<R: Read>(reader: R, delimiter: u8) -> Result<Dataset> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true) // short rows are reported as incomplete, not as a parse failure
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let layout = ColumnLayout::resolve(&headers)?;

    let mut records = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut total_rows = 0;
    let mut dropped_rows = 0;

    for (row, result) in rdr.byte_records().enumerate() {
        let bytes = result?;
        total_rows += 1;

        let parsed = StringRecord::from_byte_record(bytes)
            .map_err(|_| RowIssue::InvalidUtf8)
            .and_then(|raw| layout.parse(&raw));

        match parsed {
            Ok(record) => {
                if seen_ids.insert(record.patient_id.clone()) {
                    records.push(record);
                } else {
                    debug!(row = row + 1, patient_id = %record.patient_id, "dropping duplicate patient id");
                    dropped_rows += 1;
                }
            }
            Err(issue) => {
                debug!(row = row + 1, %issue, "dropping row");
                dropped_rows += 1;
            }
        }
    }

    if dropped_rows > 0 {
        warn!(dropped_rows, total_rows, "dropped incomplete or invalid rows");
    }
    info!(rows = records.len(), extra_columns = layout.extras.len(), "patient table loaded");

    Ok(Dataset {
        records,
        extra_columns: layout.extras.iter().map(|&i| headers[i].clone()).collect(),
        total_rows,
        dropped_rows,
    })
}

/// where each required column lives in the header row
struct ColumnLayout {
    required: [usize; REQUIRED_COLUMNS.len()],
    extras: Vec<usize>,
}

impl ColumnLayout {
    fn resolve(headers: &[String]) -> Result<Self> {
        let mut required = [0usize; REQUIRED_COLUMNS.len()];
        let mut missing = Vec::new();

        for (slot, name) in REQUIRED_COLUMNS.iter().enumerate() {
            match headers.iter().position(|h| h == name) {
                Some(idx) => required[slot] = idx,
                None => missing.push(name.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(SurvivalError::schema(missing));
        }

        let extras = (0..headers.len())
            .filter(|idx| !required.contains(idx))
            .collect();

        Ok(Self { required, extras })
    }

    fn field<'r>(&self, raw: &'r StringRecord, slot: usize) -> std::result::Result<&'r str, RowIssue> {
        let column = REQUIRED_COLUMNS[slot];
        match raw.get(self.required[slot]) {
            Some(value) if !is_missing(value) => Ok(value),
            _ => Err(RowIssue::Missing(column)),
        }
    }

    fn parse(&self, raw: &StringRecord) -> std::result::Result<PatientRecord, RowIssue> {
        let patient_id = self.field(raw, 0)?;
        let age = parse_non_negative(self.field(raw, 1)?, REQUIRED_COLUMNS[1])?;
        let sex = self.field(raw, 2)?;
        let diagnosis_code = self.field(raw, 3)?;
        let treatment_type = self.field(raw, 4)?;
        let duration = parse_non_negative(self.field(raw, 5)?, REQUIRED_COLUMNS[5])?;
        let event = parse_event(self.field(raw, 6)?)?;

        let extra = self
            .extras
            .iter()
            .map(|&i| raw.get(i).unwrap_or_default().to_string())
            .collect();

        Ok(PatientRecord::new(
            patient_id,
            age,
            sex,
            diagnosis_code,
            treatment_type,
            duration,
            event,
        )
        .with_extra(extra))
    }
}

/// why a row got dropped
#[derive(Debug)]
enum RowIssue {
    Missing(&'static str),
    Invalid { column: &'static str, value: String },
    InvalidUtf8,
}

impl fmt::Display for RowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowIssue::Missing(column) => write!(f, "missing {column}"),
            RowIssue::Invalid { column, value } => write!(f, "invalid {column} '{value}'"),
            RowIssue::InvalidUtf8 => write!(f, "row isn't valid UTF-8"),
        }
    }
}

fn is_missing(value: &str) -> bool {
    let value = value.trim();
    MISSING_TOKENS.iter().any(|token| value.eq_ignore_ascii_case(token))
}

fn parse_non_negative(value: &str, column: &'static str) -> std::result::Result<f64, RowIssue> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(RowIssue::Invalid {
            column,
            value: value.to_string(),
        }),
    }
}

fn parse_event(value: &str) -> std::result::Result<bool, RowIssue> {
    if value.eq_ignore_ascii_case("true") {
        return Ok(true);
    }
    if value.eq_ignore_ascii_case("false") {
        return Ok(false);
    }
    match value.parse::<f64>() {
        Ok(v) if v == 1.0 => Ok(true),
        Ok(v) if v == 0.0 => Ok(false),
        _ => Err(RowIssue::Invalid {
            column: "event",
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "patient_id,age,sex,diagnosis_code,treatment_type,duration,event";

    #[test]
    fn test_load_well_formed_rows() {
        let input = format!("{HEADER}\n1,54,M,I10,medical,120,1\n2,61,F,E11,surgical,300,0\n");
        let dataset = load_reader(input.as_bytes()).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.dropped_rows, 0);
        assert_eq!(dataset.total_rows, 2);
        assert_eq!(dataset.records[0], PatientRecord::new("1", 54.0, "M", "I10", "medical", 120.0, true));
        assert!(!dataset.records[1].event);
    }

    #[test]
    fn test_missing_columns_reported_together() {
        let input = "patient_id,age,sex,duration\n1,54,M,10\n";
        match load_reader(input.as_bytes()) {
            Err(SurvivalError::Schema { missing }) => {
                assert_eq!(missing, vec!["diagnosis_code", "treatment_type", "event"]);
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_rows_dropped_and_counted() {
        let input = format!(
            "{HEADER}\n1,54,M,I10,medical,120,1\n2,,F,E11,surgical,300,0\n3,40,NA,E11,medical,10,1\n4,70,F,J44\n"
        );
        let dataset = load_reader(input.as_bytes()).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.dropped_rows, 3);
        assert_eq!(dataset.total_rows, 4);
    }

    #[test]
    fn test_invalid_values_dropped() {
        let input = format!(
            "{HEADER}\n1,54,M,I10,medical,-5,1\n2,61,F,E11,surgical,300,2\n\
             3,abc,F,E11,medical,10,1\n4,33,F,K21,medical,10,true\n"
        );
        let dataset = load_reader(input.as_bytes()).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.records[0].patient_id, "4");
        assert!(dataset.records[0].event);
        assert_eq!(dataset.dropped_rows, 3);
    }

    #[test]
    fn test_undecodable_row_dropped() {
        let mut input = format!("{HEADER}\n1,54,M,I10,medical,120,1\n").into_bytes();
        input.extend_from_slice(b"2,61,F,E\xff11,surgical,300,0\n");
        input.extend_from_slice(b"3,47,F,J44,medical,80,1\n");

        let dataset = load_reader(input.as_slice()).unwrap();
        assert_eq!(dataset.total_rows, 3);
        assert_eq!(dataset.dropped_rows, 1);
        let ids: Vec<&str> = dataset.records.iter().map(|r| r.patient_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let input = format!("{HEADER}\n7,54,M,I10,medical,120,1\n7,61,F,E11,surgical,300,0\n");
        let dataset = load_reader(input.as_bytes()).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.records[0].sex, "M");
        assert_eq!(dataset.dropped_rows, 1);
    }

    #[test]
    fn test_columns_in_any_order_with_extras() {
        let input = "event,bmi,duration,treatment_type,diagnosis_code,sex,age,patient_id\n\
                     1,27.5,90,medical,I10,F,48,p1\n";
        let dataset = load_reader(input.as_bytes()).unwrap();

        assert_eq!(dataset.extra_columns, vec!["bmi"]);
        let record = &dataset.records[0];
        assert_eq!(record.patient_id, "p1");
        assert_eq!(record.age, 48.0);
        assert_eq!(record.duration, 90.0);
        assert_eq!(record.extra, vec!["27.5"]);
    }

    #[test]
    fn test_tab_delimited() {
        let input = "patient_id\tage\tsex\tdiagnosis_code\ttreatment_type\tduration\tevent\n\
                     1\t50\tM\tN18\tcombined\t15\t0\n";
        let dataset = load_reader_with(input.as_bytes(), b'\t').unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.records[0].diagnosis_code, "N18");
    }
}
