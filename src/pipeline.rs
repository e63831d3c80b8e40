//! one pass through filter -> curves -> hazard model -> importance

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::encoding::Covariate;
use crate::error::{Result, SurvivalError};
use crate::explain::{explain, Importance};
use crate::filter::{self, FilterCriteria, GroupBy};
use crate::kaplan_meier::{estimate, SurvivalCurve};
use crate::model::{CoxModel, FailureCause, FitOutcome};
use crate::optimization::TieMethod;
use crate::record::{Dataset, PatientRecord};

fn default_covariates() -> Vec<Covariate> {
    Covariate::ALL.to_vec()
}

fn default_max_iterations() -> usize {
    100
}

fn default_tolerance() -> f64 {
    1e-7
}

/// everything a run needs besides the data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub criteria: FilterCriteria,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default = "default_covariates")]
    pub covariates: Vec<Covariate>,
    #[serde(default)]
    pub penalizer: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub ties: TieMethod,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            criteria: FilterCriteria::default(),
            group_by: GroupBy::None,
            covariates: default_covariates(),
            penalizer: 0.0,
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            ties: TieMethod::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// parse json, missing fields fall back to defaults
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_criteria(mut self, criteria: FilterCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_covariates(mut self, covariates: Vec<Covariate>) -> Self {
        self.covariates = covariates;
        self
    }

    pub fn with_penalizer(mut self, penalizer: f64) -> Self {
        self.penalizer = penalizer;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.criteria.validate()?;

        if !self.penalizer.is_finite() || self.penalizer < 0.0 {
            return Err(SurvivalError::invalid_parameter("penalizer", self.penalizer.to_string()));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(SurvivalError::invalid_parameter("tolerance", self.tolerance.to_string()));
        }
        if self.max_iterations == 0 {
            return Err(SurvivalError::invalid_parameter("max_iterations", "0"));
        }
        Ok(())
    }

    /// the fitter this configuration describes
    pub fn model(&self) -> CoxModel {
        CoxModel::new()
            .with_penalizer(self.penalizer)
            .with_max_iterations(self.max_iterations)
            .with_tolerance(self.tolerance)
            .with_ties(self.ties)
    }
}

/// non-fatal things the caller should surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineWarning {
    EmptyCohort,
    FitFailed(FailureCause),
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::EmptyCohort => write!(f, "no patients match the current filters"),
            PipelineWarning::FitFailed(cause) => write!(f, "hazard model could not be fit: {cause} ({})", cause.hint()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub cohort: Vec<PatientRecord>,
    pub curves: Vec<SurvivalCurve>,
    pub fit: FitOutcome,
    pub importance: Importance,
    pub warnings: Vec<PipelineWarning>,
}

/// run the full analysis; only an invalid config is an error
pub fn run(dataset: &Dataset, config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;

    let cohort = filter::apply(&dataset.records, &config.criteria);
    let mut warnings = Vec::new();
    if cohort.is_empty() {
        warn!("no patients match the current filters");
        warnings.push(PipelineWarning::EmptyCohort);
    }

    let curves = estimate(&cohort, config.group_by)?;

    let fit = config.model().fit_cohort(&cohort, &config.covariates);
    if let FitOutcome::Failed(failure) = &fit {
        // an empty cohort has already been reported
        if failure.cause != FailureCause::EmptyCohort {
            warnings.push(PipelineWarning::FitFailed(failure.cause));
        }
    }

    let importance = explain(&fit, &cohort);

    info!(
        records = dataset.len(),
        cohort = cohort.len(),
        curves = curves.len(),
        fitted = fit.is_fitted(),
        "pipeline finished"
    );

    Ok(PipelineReport {
        cohort,
        curves,
        fit,
        importance,
        warnings,
    })
}
