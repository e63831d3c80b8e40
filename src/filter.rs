//! cohort selection - filter criteria, grouping keys & partitions

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SurvivalError};
use crate::record::PatientRecord;

/// active selection - every field is optional, absent fields don't constrain
///
/// categorical filters hold a set of accepted values; `None` accepts
/// everything while an empty set accepts nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    pub age_min: Option<f64>, // inclusive
    pub age_max: Option<f64>, // inclusive
    pub sex: Option<BTreeSet<String>>,
    pub diagnosis_code: Option<BTreeSet<String>>,
    pub treatment_type: Option<BTreeSet<String>>,
}

impl FilterCriteria {
    /// no constraints at all
    pub fn new() -> Self {
        Self::default()
    }

    /// inclusive on both ends
    pub fn with_age_range(mut self, min: f64, max: f64) -> Self {
        self.age_min = Some(min);
        self.age_max = Some(max);
        self
    }

    pub fn with_sex(mut self, sex: impl Into<String>) -> Self {
        self.sex.get_or_insert_with(BTreeSet::new).insert(sex.into());
        self
    }

    pub fn with_diagnosis_code(mut self, code: impl Into<String>) -> Self {
        self.diagnosis_code.get_or_insert_with(BTreeSet::new).insert(code.into());
        self
    }

    pub fn with_treatment_type(mut self, treatment: impl Into<String>) -> Self {
        self.treatment_type.get_or_insert_with(BTreeSet::new).insert(treatment.into());
        self
    }

    /// reject NaN or inverted age bounds
    pub fn validate(&self) -> Result<()> {
        for (name, bound) in [("age_min", self.age_min), ("age_max", self.age_max)] {
            if let Some(value) = bound {
                if value.is_nan() {
                    return Err(SurvivalError::invalid_parameter(name, "NaN"));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.age_min, self.age_max) {
            if min > max {
                return Err(SurvivalError::invalid_parameter(
                    "age range",
                    format!("[{min}, {max}]"),
                ));
            }
        }
        Ok(())
    }

    /// does this record satisfy every active predicate?
    pub fn matches(&self, record: &PatientRecord) -> bool {
        let age_ok = self.age_min.map_or(true, |min| record.age >= min)
            && self.age_max.map_or(true, |max| record.age <= max);

        age_ok
            && accepts(&self.sex, &record.sex)
            && accepts(&self.diagnosis_code, &record.diagnosis_code)
            && accepts(&self.treatment_type, &record.treatment_type)
    }

    /// true when nothing is constrained
    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }
}

fn accepts(allowed: &Option<BTreeSet<String>>, value: &str) -> bool {
    allowed.as_ref().map_or(true, |set| set.contains(value))
}

/// select the records matching `criteria`, keeping their original order
pub fn apply(records: &[PatientRecord], criteria: &FilterCriteria) -> Vec<PatientRecord> {
    if criteria.is_unconstrained() {
        debug!(input = records.len(), "no filter criteria, keeping every record");
        return records.to_vec();
    }

    let cohort: Vec<PatientRecord> = records
        .iter()
        .filter(|record| criteria.matches(record))
        .cloned()
        .collect();

    debug!(input = records.len(), selected = cohort.len(), "applied filter criteria");
    cohort
}

/// field used to split a cohort into curves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    None,
    Sex,
    DiagnosisCode,
    TreatmentType,
}

impl GroupBy {
    /// the grouping value of a record, None when not grouping
    pub fn key<'r>(&self, record: &'r PatientRecord) -> Option<&'r str> {
        match self {
            GroupBy::None => None,
            GroupBy::Sex => Some(&record.sex),
            GroupBy::DiagnosisCode => Some(&record.diagnosis_code),
            GroupBy::TreatmentType => Some(&record.treatment_type),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::None => "none",
            GroupBy::Sex => "sex",
            GroupBy::DiagnosisCode => "diagnosis_code",
            GroupBy::TreatmentType => "treatment_type",
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupBy {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(GroupBy::None),
            "sex" => Ok(GroupBy::Sex),
            "diagnosis_code" | "diagnosis" => Ok(GroupBy::DiagnosisCode),
            "treatment_type" | "treatment" => Ok(GroupBy::TreatmentType),
            other => Err(SurvivalError::invalid_parameter("group_by", other)),
        }
    }
}

/// split a cohort by `group_by`, one entry per distinct value, ordered by value
///
/// with `GroupBy::None` the whole cohort comes back as a single group (empty
/// cohorts included). grouped partitions only contain values that occur, so
/// no group is ever empty.
pub fn partition(cohort: &[PatientRecord], group_by: GroupBy) -> Vec<(String, Vec<PatientRecord>)> {
    if group_by == GroupBy::None {
        return vec![(String::new(), cohort.to_vec())];
    }

    let mut groups: BTreeMap<String, Vec<PatientRecord>> = BTreeMap::new();
    for record in cohort {
        if let Some(key) = group_by.key(record) {
            groups.entry(key.to_string()).or_default().push(record.clone());
        }
    }
    groups.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cohort() -> Vec<PatientRecord> {
        vec![
            PatientRecord::new("1", 39.0, "M", "I10", "medical", 10.0, true),
            PatientRecord::new("2", 40.0, "F", "E11", "surgical", 20.0, false),
            PatientRecord::new("3", 52.5, "M", "E11", "combined", 30.0, true),
            PatientRecord::new("4", 65.0, "F", "I10", "medical", 40.0, true),
            PatientRecord::new("5", 66.0, "F", "J44", "non-invasive", 50.0, false),
        ]
    }

    fn ids(records: &[PatientRecord]) -> Vec<&str> {
        records.iter().map(|r| r.patient_id.as_str()).collect()
    }

    #[test]
    fn test_no_criteria_keeps_everything() {
        let records = cohort();
        let selected = apply(&records, &FilterCriteria::new());
        assert_eq!(selected, records);

        assert!(FilterCriteria::new().is_unconstrained());
        assert!(!FilterCriteria::new().with_age_range(0.0, 120.0).is_unconstrained());
        assert!(!FilterCriteria::new().with_sex("F").is_unconstrained());
    }

    #[test]
    fn test_age_bounds_inclusive() {
        let records = cohort();
        let selected = apply(&records, &FilterCriteria::new().with_age_range(40.0, 65.0));
        assert_eq!(ids(&selected), vec!["2", "3", "4"]);
    }

    #[test]
    fn test_categorical_filters_combine() {
        let records = cohort();
        let criteria = FilterCriteria::new()
            .with_sex("F")
            .with_diagnosis_code("I10")
            .with_diagnosis_code("J44");
        assert_eq!(ids(&apply(&records, &criteria)), vec!["4", "5"]);

        let criteria = criteria.with_treatment_type("medical");
        assert_eq!(ids(&apply(&records, &criteria)), vec!["4"]);
    }

    #[test]
    fn test_empty_selection_is_fine() {
        let records = cohort();
        let criteria = FilterCriteria::new().with_diagnosis_code("Z99");
        assert!(apply(&records, &criteria).is_empty());

        let nothing_allowed = FilterCriteria {
            sex: Some(BTreeSet::new()),
            ..Default::default()
        };
        assert!(apply(&records, &nothing_allowed).is_empty());
    }

    #[test]
    fn test_source_untouched() {
        let records = cohort();
        let before = records.clone();
        let _ = apply(&records, &FilterCriteria::new().with_sex("M"));
        assert_eq!(records, before);
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        assert!(FilterCriteria::new().with_age_range(70.0, 30.0).validate().is_err());
        assert!(FilterCriteria::new().with_age_range(30.0, 70.0).validate().is_ok());
        let nan = FilterCriteria { age_min: Some(f64::NAN), ..Default::default() };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_partition_is_exact() {
        let records = cohort();
        let groups = partition(&records, GroupBy::DiagnosisCode);

        let keys: Vec<&str> = groups.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["E11", "I10", "J44"]);

        let total: usize = groups.iter().map(|(_, g)| g.len()).sum();
        assert_eq!(total, records.len());
        for (key, members) in &groups {
            assert!(!members.is_empty());
            assert!(members.iter().all(|r| &r.diagnosis_code == key));
        }
    }

    #[test]
    fn test_partition_without_key() {
        let records = cohort();
        let groups = partition(&records, GroupBy::None);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), records.len());

        assert!(partition(&[], GroupBy::Sex).is_empty());
    }

    #[test]
    fn test_group_by_parsing() {
        assert_eq!("sex".parse::<GroupBy>().unwrap(), GroupBy::Sex);
        assert_eq!("diagnosis_code".parse::<GroupBy>().unwrap(), GroupBy::DiagnosisCode);
        assert_eq!("Treatment_Type".parse::<GroupBy>().unwrap(), GroupBy::TreatmentType);
        assert_eq!("none".parse::<GroupBy>().unwrap(), GroupBy::None);
        assert!("blood_type".parse::<GroupBy>().is_err());
        assert_eq!(GroupBy::DiagnosisCode.to_string(), "diagnosis_code");
    }
}
