//! covariate encoding - patient records to a design matrix
//!
//! numeric covariates pass through as-is. categorical ones are one-hot
//! encoded with their levels sorted and the first level dropped as the
//! reference, so a covariate with k levels becomes k - 1 indicator columns
//! named `<covariate>_<level>`.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::data::SurvivalData;
use crate::error::{Result, SurvivalError};
use crate::record::PatientRecord;

/// patient fields usable as model covariates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    Age,
    Sex,
    DiagnosisCode,
    TreatmentType,
}

impl Covariate {
    pub const ALL: [Covariate; 4] = [
        Covariate::Age,
        Covariate::Sex,
        Covariate::DiagnosisCode,
        Covariate::TreatmentType,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Covariate::Age => "age",
            Covariate::Sex => "sex",
            Covariate::DiagnosisCode => "diagnosis_code",
            Covariate::TreatmentType => "treatment_type",
        }
    }

    pub fn is_categorical(&self) -> bool {
        !matches!(self, Covariate::Age)
    }

    fn category<'r>(&self, record: &'r PatientRecord) -> &'r str {
        match self {
            Covariate::Age => "",
            Covariate::Sex => &record.sex,
            Covariate::DiagnosisCode => &record.diagnosis_code,
            Covariate::TreatmentType => &record.treatment_type,
        }
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Covariate {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        Covariate::ALL
            .into_iter()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| SurvivalError::invalid_parameter("covariate", s))
    }
}

/// one column of the design matrix
#[derive(Debug, Clone, PartialEq)]
enum Column {
    Numeric(Covariate),
    Indicator { covariate: Covariate, level: String },
}

impl Column {
    fn name(&self) -> String {
        match self {
            Column::Numeric(covariate) => covariate.name().to_string(),
            Column::Indicator { covariate, level } => format!("{}_{}", covariate.name(), level),
        }
    }

    fn value(&self, record: &PatientRecord) -> f64 {
        match self {
            Column::Numeric(Covariate::Age) => record.age,
            Column::Numeric(_) => 0.0,
            Column::Indicator { covariate, level } => {
                if covariate.category(record) == level {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// learned encoding: which columns exist and which level each categorical dropped
///
/// records carrying a level the encoder never saw encode as the reference.
#[derive(Debug, Clone, PartialEq)]
pub struct CovariateEncoder {
    covariates: Vec<Covariate>,
    columns: Vec<Column>,
    references: Vec<(Covariate, String)>,
}

impl CovariateEncoder {
    /// learn levels from `cohort`; duplicate covariates are ignored
    pub fn fit(cohort: &[PatientRecord], covariates: &[Covariate]) -> Self {
        let mut unique: Vec<Covariate> = Vec::with_capacity(covariates.len());
        for &covariate in covariates {
            if !unique.contains(&covariate) {
                unique.push(covariate);
            }
        }

        let mut columns = Vec::new();
        let mut references = Vec::new();

        for &covariate in &unique {
            if !covariate.is_categorical() {
                columns.push(Column::Numeric(covariate));
                continue;
            }

            let mut levels: Vec<&str> = cohort.iter().map(|r| covariate.category(r)).collect();
            levels.sort_unstable();
            levels.dedup();

            if let Some((reference, rest)) = levels.split_first() {
                references.push((covariate, reference.to_string()));
                columns.extend(rest.iter().map(|level| Column::Indicator {
                    covariate,
                    level: level.to_string(),
                }));
            }
        }

        Self {
            covariates: unique,
            columns,
            references,
        }
    }

    pub fn covariates(&self) -> &[Covariate] {
        &self.covariates
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.columns.iter().map(Column::name).collect()
    }

    /// level absorbed into the baseline for a categorical covariate
    pub fn reference_level(&self, covariate: Covariate) -> Option<&str> {
        self.references
            .iter()
            .find(|(c, _)| *c == covariate)
            .map(|(_, level)| level.as_str())
    }

    /// design matrix, one row per record
    pub fn encode(&self, records: &[PatientRecord]) -> Array2<f64> {
        Array2::from_shape_fn((records.len(), self.columns.len()), |(i, j)| {
            self.columns[j].value(&records[i])
        })
    }

    /// design matrix plus durations & events, ready for fitting
    pub fn survival_data(&self, records: &[PatientRecord]) -> Result<SurvivalData> {
        SurvivalData::with_feature_names(
            records.iter().map(|r| r.duration).collect(),
            records.iter().map(|r| r.event).collect(),
            self.encode(records),
            self.feature_names(),
        )
    }
}
