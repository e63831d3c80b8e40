//! csv writers for the filtered cohort & the analysis results

use std::io::Write;

use tracing::debug;

use crate::error::Result;
use crate::explain::ImportanceRanking;
use crate::kaplan_meier::SurvivalCurve;
use crate::model::HazardModel;
use crate::record::{PatientRecord, REQUIRED_COLUMNS};

/// header of the coefficient table
pub const SUMMARY_COLUMNS: [&str; 10] = [
    "covariate",
    "coef",
    "exp(coef)",
    "se(coef)",
    "coef lower 95%",
    "coef upper 95%",
    "exp(coef) lower 95%",
    "exp(coef) upper 95%",
    "z",
    "p",
];

/// header of the long-format curve table
pub const CURVE_COLUMNS: [&str; 8] = [
    "label", "time", "survival", "lower_95", "upper_95", "at_risk", "observed", "censored",
];

/// cohort in the input schema: required columns first, then the passthrough ones
pub fn write_cohort<W: Write>(writer: W, extra_columns: &[String], records: &[PatientRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    let mut header: Vec<&str> = REQUIRED_COLUMNS.to_vec();
    header.extend(extra_columns.iter().map(String::as_str));
    wtr.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.patient_id.clone(),
            record.age.to_string(),
            record.sex.clone(),
            record.diagnosis_code.clone(),
            record.treatment_type.clone(),
            record.duration.to_string(),
            if record.event { "1" } else { "0" }.to_string(),
        ];
        // pad/truncate so every row matches the header
        row.extend((0..extra_columns.len()).map(|j| record.extra.get(j).cloned().unwrap_or_default()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    debug!(rows = records.len(), "wrote cohort");
    Ok(())
}

/// one row per model feature
pub fn write_summary<W: Write>(writer: W, model: &HazardModel) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(SUMMARY_COLUMNS)?;

    for row in model.summary() {
        wtr.write_record([
            row.covariate,
            row.coef.to_string(),
            row.hazard_ratio.to_string(),
            row.se.to_string(),
            row.coef_lower_95.to_string(),
            row.coef_upper_95.to_string(),
            row.hazard_ratio_lower_95.to_string(),
            row.hazard_ratio_upper_95.to_string(),
            row.z.to_string(),
            row.p.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// every curve point, curves one after another
pub fn write_curves<W: Write>(writer: W, curves: &[SurvivalCurve]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(CURVE_COLUMNS)?;

    for curve in curves {
        for k in 0..curve.len() {
            wtr.write_record([
                curve.label.clone(),
                curve.timeline[k].to_string(),
                curve.survival[k].to_string(),
                curve.lower_95[k].to_string(),
                curve.upper_95[k].to_string(),
                curve.at_risk[k].to_string(),
                curve.observed[k].to_string(),
                curve.censored[k].to_string(),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_importance<W: Write>(writer: W, ranking: &ImportanceRanking) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["feature", "mean_abs_contribution"])?;
    for contribution in &ranking.features {
        wtr.write_record([contribution.feature.clone(), contribution.score.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}
