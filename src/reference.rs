//! diagnosis code reference table
//!
//! the built-in table is constructed once and shared; external tables can be
//! loaded from json with the same shape.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SurvivalError};

/// version tag of the built-in table
pub const REFERENCE_VERSION: &str = "2024.1";

/// treatment categories and what they mean in plain words
pub const TREATMENT_TYPES: [(&str, &str); 4] = [
    ("surgical", "Involves physical interventions such as operations or procedures."),
    ("medical", "Uses drugs or medications to treat conditions."),
    ("combined", "Uses both surgical and medical treatments for comprehensive care."),
    (
        "non-invasive",
        "Treatments that do not require entering the body or breaking the skin (e.g., therapy, lifestyle changes).",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub code: String,
    pub condition: String,
    pub description: String, // layman explanation
    #[serde(default)]
    pub treatments: Vec<String>,
    #[serde(default)]
    pub procedures: Vec<String>,
}

/// read-only code -> entry table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisReference {
    version: String,
    entries: BTreeMap<String, ReferenceEntry>,
}

#[derive(Deserialize)]
struct ReferenceFile {
    version: String,
    entries: Vec<ReferenceEntry>,
}

static BUILTIN: OnceLock<DiagnosisReference> = OnceLock::new();

impl DiagnosisReference {
    /// the table shipped with the crate
    pub fn builtin() -> &'static DiagnosisReference {
        BUILTIN.get_or_init(|| Self::from_entries(REFERENCE_VERSION, builtin_entries()))
    }

    fn from_entries(version: impl Into<String>, entries: Vec<ReferenceEntry>) -> Self {
        Self {
            version: version.into(),
            entries: entries.into_iter().map(|e| (e.code.clone(), e)).collect(),
        }
    }

    /// load `{"version": "..", "entries": [..]}`; duplicate codes are rejected
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        let file: ReferenceFile = serde_json::from_reader(reader)?;

        let mut entries = BTreeMap::new();
        for entry in file.entries {
            let code = entry.code.trim().to_string();
            if code.is_empty() {
                return Err(SurvivalError::invalid_parameter("code", "<empty>"));
            }
            if entries.insert(code.clone(), entry).is_some() {
                return Err(SurvivalError::invalid_parameter("code", format!("{code} (duplicate)")));
            }
        }

        debug!(version = %file.version, entries = entries.len(), "loaded diagnosis reference");
        Ok(Self {
            version: file.version,
            entries,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `None` when the code isn't in the table
    pub fn lookup(&self, code: &str) -> Option<&ReferenceEntry> {
        self.entries.get(code.trim())
    }

    /// all known codes, sorted
    pub fn codes(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReferenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// glossary text for a treatment category, case-insensitive
pub fn describe_treatment_type(kind: &str) -> Option<&'static str> {
    let kind = kind.trim();
    TREATMENT_TYPES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(kind))
        .map(|(_, text)| *text)
}

fn entry(code: &str, condition: &str, description: &str, treatments: &[&str], procedures: &[&str]) -> ReferenceEntry {
    ReferenceEntry {
        code: code.to_string(),
        condition: condition.to_string(),
        description: description.to_string(),
        treatments: treatments.iter().map(|s| s.to_string()).collect(),
        procedures: procedures.iter().map(|s| s.to_string()).collect(),
    }
}

fn builtin_entries() -> Vec<ReferenceEntry> {
    vec![
        entry(
            "I10",
            "Hypertension",
            "Essential (primary) hypertension: high blood pressure with no identifiable cause.",
            &["ACE Inhibitors", "Beta Blockers"],
            &["Blood Pressure Monitoring"],
        ),
        entry(
            "E11",
            "Type 2 Diabetes",
            "Type 2 diabetes mellitus: chronic condition affecting the way the body processes blood sugar.",
            &["Insulin", "Metformin"],
            &["HbA1c Test", "Retinal Screening"],
        ),
        entry(
            "J44",
            "COPD",
            "Chronic obstructive pulmonary disease (COPD): \
             a group of lung conditions that cause breathing difficulties.",
            &["Bronchodilators", "Steroids"],
            &["Pulmonary Function Test"],
        ),
        entry(
            "K21",
            "GERD",
            "Gastroesophageal reflux disease (GERD): acid reflux that irritates the esophagus.",
            &["Antacids", "PPIs"],
            &["Endoscopy"],
        ),
        entry(
            "N18",
            "Chronic Kidney Disease",
            "Chronic kidney disease: gradual loss of kidney function over time.",
            &["Dialysis", "ACE Inhibitors"],
            &["Creatinine Test", "GFR Measurement"],
        ),
        entry(
            "F41",
            "Anxiety Disorders",
            "Anxiety disorders: a group of mental health disorders characterized by excessive fear or anxiety.",
            &["SSRIs", "CBT"],
            &["Psychiatric Evaluation"],
        ),
        entry(
            "M54",
            "Back Pain",
            "Back pain: pain in the back often due to musculoskeletal issues.",
            &["NSAIDs", "Physical Therapy"],
            &["X-ray", "MRI"],
        ),
        entry(
            "R51",
            "Headache",
            "Headache: pain in any region of the head.",
            &["Analgesics", "Triptans"],
            &["Neurological Exam"],
        ),
    ]
}
