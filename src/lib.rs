//! # medsurvive
//!
//! filter a patient table, draw kaplan-meier curves, fit a cox model and rank
//! what drives the hazard - survival analysis for clinical cohorts
//!
//! ## what you get
//!
//! - csv loading w/ schema checks (incomplete rows dropped, never imputed)
//! - cohort filters & grouping by sex / diagnosis / treatment
//! - kaplan-meier curves with greenwood confidence bands
//! - cox proportional hazards w/ optional ridge penalty, efron or breslow ties
//! - shapley feature importance on the partial hazard
//! - a small diagnosis code reference
//!
//! ## quick start
//!
//! ```rust
//! use medsurvive::{loader, pipeline, FilterCriteria, GroupBy, PipelineConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let csv = "\
//! patient_id,age,sex,diagnosis_code,treatment_type,duration,event
//! 1,45,M,I10,medical,5,1
//! 2,52,F,E11,surgical,9,0
//! 3,61,M,E11,medical,3,1
//! 4,38,F,I10,surgical,12,1
//! 5,70,M,I10,surgical,2,1
//! 6,49,F,E11,medical,15,0
//! 7,58,F,I10,medical,7,1
//! 8,66,M,E11,surgical,4,0
//! ";
//! let dataset = loader::load_reader(csv.as_bytes())?;
//!
//! let config = PipelineConfig::new()
//!     .with_criteria(FilterCriteria::new().with_age_range(40.0, 70.0))
//!     .with_group_by(GroupBy::Sex)
//!     .with_penalizer(0.1); // ridge
//!
//! let report = pipeline::run(&dataset, &config)?;
//! for curve in &report.curves {
//!     println!("{}: median {:?}", curve.label, curve.median_survival_time());
//! }
//! if let Some(model) = report.fit.model() {
//!     println!("{model}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod encoding;
pub mod error;
pub mod explain;
pub mod export;
pub mod filter;
pub mod kaplan_meier;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod pipeline;
pub mod record;
pub mod reference;

pub use data::SurvivalData;
pub use encoding::{Covariate, CovariateEncoder};
pub use error::{Result, SurvivalError};
pub use explain::{explain, Importance, ImportanceRanking};
pub use filter::{FilterCriteria, GroupBy};
pub use kaplan_meier::{KaplanMeier, SurvivalCurve};
pub use model::{CoxModel, FailureCause, FitFailure, FitOutcome, HazardModel};
pub use optimization::TieMethod;
pub use pipeline::{PipelineConfig, PipelineReport, PipelineWarning};
pub use record::{Dataset, PatientRecord};
pub use reference::{DiagnosisReference, ReferenceEntry};
