//! patient rows & the loaded table

/// columns every input file has to carry, in export order
pub const REQUIRED_COLUMNS: [&str; 7] = [
    "patient_id",
    "age",
    "sex",
    "diagnosis_code",
    "treatment_type",
    "duration",
    "event",
];

/// one patient row - a time-to-event observation plus the fields we filter on
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub patient_id: String,
    pub age: f64,
    pub sex: String,
    pub diagnosis_code: String,
    pub treatment_type: String,
    pub duration: f64, // time to event or censoring, dataset's time unit
    pub event: bool,   // true = event observed, false = censored
    pub extra: Vec<String>, // passthrough columns, same order as Dataset::extra_columns
}

impl PatientRecord {
    pub fn new(
        patient_id: impl Into<String>,
        age: f64,
        sex: impl Into<String>,
        diagnosis_code: impl Into<String>,
        treatment_type: impl Into<String>,
        duration: f64,
        event: bool,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            age,
            sex: sex.into(),
            diagnosis_code: diagnosis_code.into(),
            treatment_type: treatment_type.into(),
            duration,
            event,
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, extra: Vec<String>) -> Self {
        self.extra = extra;
        self
    }
}

/// in-memory table produced by the loader
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub records: Vec<PatientRecord>,
    pub extra_columns: Vec<String>,
    pub total_rows: usize,   // data rows seen in the source
    pub dropped_rows: usize, // rows excluded as incomplete or invalid
}

impl Dataset {
    pub fn from_records(records: Vec<PatientRecord>) -> Self {
        let total_rows = records.len();
        Self {
            records,
            extra_columns: Vec::new(),
            total_rows,
            dropped_rows: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// distinct values of a categorical field, sorted
    pub fn levels(&self, field: impl Fn(&PatientRecord) -> &str) -> Vec<String> {
        let mut levels: Vec<String> = self.records.iter().map(|r| field(r).to_string()).collect();
        levels.sort();
        levels.dedup();
        levels
    }

    /// (min, max) age, None when there are no rows
    pub fn age_span(&self) -> Option<(f64, f64)> {
        self.records.iter().map(|r| r.age).fold(None, |span, age| match span {
            None => Some((age, age)),
            Some((lo, hi)) => Some((lo.min(age), hi.max(age))),
        })
    }
}
