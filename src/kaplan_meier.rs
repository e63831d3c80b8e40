//! kaplan-meier survival curves
//!
//! at each distinct observed time t the running estimate is multiplied by
//! `1 - d_t / n_t`, where `d_t` is the number of events at t and `n_t` the
//! number of subjects whose duration is >= t. censor-only times stay on the
//! timeline with the estimate unchanged so curves from different groups share
//! the same x semantics when overlaid.

use std::cmp::Ordering;

use tracing::debug;

use crate::error::{Result, SurvivalError};
use crate::filter::{partition, GroupBy};
use crate::record::PatientRecord;

/// label of the ungrouped curve
pub const ALL_PATIENTS: &str = "All Patients";

/// two-sided 95% normal quantile
const Z_95: f64 = 1.959_963_984_540_054;

/// step function from elapsed time to survival probability
///
/// `timeline[0]` is always `0.0` with `survival[0] == 1.0`. subjects with a
/// duration of exactly zero show up as a second point at time zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalCurve {
    pub label: String,
    pub timeline: Vec<f64>,
    pub survival: Vec<f64>,
    pub lower_95: Vec<f64>, // greenwood, log(-log) transformed
    pub upper_95: Vec<f64>,
    pub at_risk: Vec<usize>,  // subjects with duration >= t
    pub observed: Vec<usize>, // events at t
    pub censored: Vec<usize>, // censorings at t
    pub n_subjects: usize,
}

impl SurvivalCurve {
    /// survival probability at `t` (right-continuous)
    pub fn survival_at(&self, t: f64) -> f64 {
        let idx = self.timeline.partition_point(|&x| x <= t);
        if idx == 0 {
            1.0
        } else {
            self.survival[idx - 1]
        }
    }

    /// first time the estimate drops to 0.5 or below
    pub fn median_survival_time(&self) -> Option<f64> {
        self.survival
            .iter()
            .position(|&s| s <= 0.5)
            .map(|i| self.timeline[i])
    }

    pub fn n_events(&self) -> usize {
        self.observed.iter().sum()
    }

    /// number of points on the curve, origin included
    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }
}

/// the estimator itself - works on raw durations so it doesn't care where they came from
pub struct KaplanMeier;

impl KaplanMeier {
    /// fit a curve to (duration, event) pairs
    pub fn fit(times: &[f64], events: &[bool], label: impl Into<String>) -> Result<SurvivalCurve> {
        if times.len() != events.len() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                times.len(),
                events.len()
            )));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(
                "durations must be non-negative & finite",
            ));
        }

        let n = times.len();
        let mut observations: Vec<(f64, bool)> = times.iter().copied().zip(events.iter().copied()).collect();
        observations.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let mut curve = SurvivalCurve {
            label: label.into(),
            timeline: vec![0.0],
            survival: vec![1.0],
            lower_95: vec![1.0],
            upper_95: vec![1.0],
            at_risk: vec![n],
            observed: vec![0],
            censored: vec![0],
            n_subjects: n,
        };

        let mut survival = 1.0_f64;
        let mut greenwood = 0.0_f64; // running sum of d / (n (n - d))
        let mut i = 0;

        while i < n {
            let t = observations[i].0;
            let at_risk = n - i;

            let mut deaths = 0usize;
            let mut j = i;
            while j < n && observations[j].0 == t {
                if observations[j].1 {
                    deaths += 1;
                }
                j += 1;
            }
            let censored = (j - i) - deaths;

            if deaths > 0 {
                survival *= 1.0 - deaths as f64 / at_risk as f64;
                if deaths < at_risk {
                    greenwood += deaths as f64 / (at_risk as f64 * (at_risk - deaths) as f64);
                }
            }

            let (lower, upper) = log_log_band(survival, greenwood);

            curve.timeline.push(t);
            curve.survival.push(survival);
            curve.lower_95.push(lower);
            curve.upper_95.push(upper);
            curve.at_risk.push(at_risk);
            curve.observed.push(deaths);
            curve.censored.push(censored);

            i = j;
        }

        Ok(curve)
    }
}

/// 95% band around `survival` from the greenwood sum
fn log_log_band(survival: f64, greenwood: f64) -> (f64, f64) {
    if survival >= 1.0 {
        return (1.0, 1.0);
    }
    if survival <= 0.0 {
        return (0.0, 0.0);
    }

    let log_s = survival.ln();
    let se = greenwood.sqrt() / log_s.abs();
    let lower = survival.powf((Z_95 * se).exp());
    let upper = survival.powf((-Z_95 * se).exp());
    (lower, upper)
}

/// one curve for the whole cohort, or one per non-empty group
///
/// without a grouping key the result is always a single curve (a flat one
/// for an empty cohort). with a key, an empty cohort yields no curves.
pub fn estimate(cohort: &[PatientRecord], group_by: GroupBy) -> Result<Vec<SurvivalCurve>> {
    let curves = partition(cohort, group_by)
        .into_iter()
        .map(|(key, members)| {
            let label = if group_by == GroupBy::None { ALL_PATIENTS.to_string() } else { key };
            let times: Vec<f64> = members.iter().map(|r| r.duration).collect();
            let events: Vec<bool> = members.iter().map(|r| r.event).collect();
            KaplanMeier::fit(&times, &events, label)
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(group_by = %group_by, curves = curves.len(), subjects = cohort.len(), "estimated survival curves");
    Ok(curves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_well_formed(curve: &SurvivalCurve) {
        assert_eq!(curve.timeline[0], 0.0);
        assert_eq!(curve.survival[0], 1.0);
        for w in curve.survival.windows(2) {
            assert!(w[1] <= w[0], "survival went up: {:?}", curve.survival);
        }
        for w in curve.timeline.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert!(curve.survival.iter().all(|&s| (0.0..=1.0).contains(&s)));
    }

    #[test]
    fn test_textbook_estimate() {
        // 6 subjects, events at 1, 3, 4; censored at 2, 5, 6
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let events = vec![true, false, true, true, false, false];
        let curve = KaplanMeier::fit(&times, &events, "x").unwrap();

        assert_well_formed(&curve);
        assert_eq!(curve.timeline, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(curve.at_risk, vec![6, 6, 5, 4, 3, 2, 1]);
        assert_relative_eq!(curve.survival_at(1.0), 5.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(curve.survival_at(2.5), 5.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(curve.survival_at(3.0), 5.0 / 6.0 * 3.0 / 4.0, epsilon = 1e-12);
        assert_relative_eq!(curve.survival_at(4.0), 5.0 / 6.0 * 3.0 / 4.0 * 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(curve.survival_at(100.0), 5.0 / 12.0, epsilon = 1e-12);
        assert_eq!(curve.median_survival_time(), Some(4.0));
        assert_eq!(curve.n_events(), 3);
    }

    #[test]
    fn test_tied_event_times() {
        let times = vec![2.0, 2.0, 2.0, 5.0];
        let events = vec![true, true, false, true];
        let curve = KaplanMeier::fit(&times, &events, "ties").unwrap();

        assert_eq!(curve.timeline, vec![0.0, 2.0, 5.0]);
        assert_eq!(curve.observed, vec![0, 2, 1]);
        assert_eq!(curve.censored, vec![0, 1, 0]);
        assert_relative_eq!(curve.survival[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(curve.survival[2], 0.0, epsilon = 1e-12);
        assert_eq!((curve.lower_95[2], curve.upper_95[2]), (0.0, 0.0));
    }

    #[test]
    fn test_no_events_flat_curve() {
        let times = vec![3.0, 1.0, 2.0];
        let events = vec![false, false, false];
        let curve = KaplanMeier::fit(&times, &events, "censored").unwrap();

        assert_well_formed(&curve);
        assert!(curve.survival.iter().all(|&s| s == 1.0));
        assert_eq!(curve.median_survival_time(), None);
    }

    #[test]
    fn test_empty_input_flat_curve() {
        let curve = KaplanMeier::fit(&[], &[], ALL_PATIENTS).unwrap();
        assert_eq!(curve.timeline, vec![0.0]);
        assert_eq!(curve.survival, vec![1.0]);
        assert_eq!(curve.n_subjects, 0);
        assert_eq!(curve.survival_at(10.0), 1.0);
    }

    #[test]
    fn test_band_brackets_estimate() {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let events = vec![true, true, false, true, true, false, true, false];
        let curve = KaplanMeier::fit(&times, &events, "band").unwrap();

        for i in 0..curve.len() {
            assert!(curve.lower_95[i] <= curve.survival[i] + 1e-12);
            assert!(curve.upper_95[i] >= curve.survival[i] - 1e-12);
            assert!(curve.lower_95[i] >= 0.0 && curve.upper_95[i] <= 1.0);
        }
    }

    #[test]
    fn test_bad_input_rejected() {
        assert!(KaplanMeier::fit(&[1.0, 2.0], &[true], "x").is_err());
        assert!(KaplanMeier::fit(&[-1.0], &[true], "x").is_err());
        assert!(KaplanMeier::fit(&[f64::NAN], &[true], "x").is_err());
    }

    #[test]
    fn test_estimate_grouped() {
        let cohort = vec![
            PatientRecord::new("1", 50.0, "M", "I10", "medical", 10.0, true),
            PatientRecord::new("2", 55.0, "F", "I10", "medical", 20.0, false),
            PatientRecord::new("3", 60.0, "M", "E11", "surgical", 15.0, true),
        ];

        let overall = estimate(&cohort, GroupBy::None).unwrap();
        assert_eq!(overall.len(), 1);
        assert_eq!(overall[0].label, ALL_PATIENTS);
        assert_eq!(overall[0].n_subjects, 3);

        let by_sex = estimate(&cohort, GroupBy::Sex).unwrap();
        let labels: Vec<&str> = by_sex.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["F", "M"]);
        assert_eq!(by_sex[1].n_subjects, 2);
        by_sex.iter().for_each(assert_well_formed);
    }

    #[test]
    fn test_estimate_empty_cohort() {
        let overall = estimate(&[], GroupBy::None).unwrap();
        assert_eq!(overall.len(), 1);
        assert_eq!(overall[0].survival, vec![1.0]);

        assert!(estimate(&[], GroupBy::TreatmentType).unwrap().is_empty());
    }
}
