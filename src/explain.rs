//! feature importance for a fitted hazard model
//!
//! explains the partial hazard `exp((x - mean) . beta)` with shapley values,
//! using the cohort (thinned to at most `MAX_BACKGROUND` rows) as the
//! background distribution. a coalition `S` is valued as the mean partial
//! hazard over background rows with the features in `S` taken from the
//! subject. every term of the linear predictor is additive, so the value of
//! a coalition only needs the per-feature terms `beta_j * (x_j - mean_j)`.
//!
//! up to `MAX_EXACT_FEATURES` encoded columns every coalition is enumerated
//! and the values are exact. wider designs fall back to averaging marginal
//! contributions over a fixed, seeded set of feature orderings. both paths
//! satisfy `base_value + sum(phi_i) == partial hazard of subject i`.
//!
//! a feature's score is its mean absolute contribution over the cohort.

use std::cmp::Ordering;
use std::fmt;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{Result, SurvivalError};
use crate::model::{FitOutcome, HazardModel};
use crate::record::PatientRecord;

/// background rows kept when valuing coalitions
const MAX_BACKGROUND: usize = 100;

/// widest design explained by full coalition enumeration
const MAX_EXACT_FEATURES: usize = 10;

/// feature orderings averaged over past `MAX_EXACT_FEATURES`
const PERMUTATIONS: usize = 64;

const PERMUTATION_SEED: u64 = 42;

/// one feature's share of the explanation
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureContribution {
    pub feature: String,
    pub score: f64, // mean |phi| over the cohort
}

/// features ordered by how much they move the partial hazard
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceRanking {
    pub features: Vec<FeatureContribution>, // descending score, ties by name
    pub base_value: f64,                    // expected partial hazard over the background
    contributions: Array2<f64>,             // n_subjects x n_features
}

impl ImportanceRanking {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn top(&self) -> Option<&FeatureContribution> {
        self.features.first()
    }

    /// per-subject contributions, columns in model feature order
    pub fn contributions(&self) -> &Array2<f64> {
        &self.contributions
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Importance {
    Available(ImportanceRanking),
    Unavailable(String),
}

impl Importance {
    pub fn ranking(&self) -> Option<&ImportanceRanking> {
        match self {
            Importance::Available(ranking) => Some(ranking),
            Importance::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Importance::Available(_))
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Importance::Unavailable(reason) => write!(f, "importance unavailable: {reason}"),
            Importance::Available(ranking) => {
                writeln!(f, "base value (expected partial hazard): {:.4}", ranking.base_value)?;
                for contribution in &ranking.features {
                    writeln!(f, "{:<28} {:>10.4}", contribution.feature, contribution.score)?;
                }
                Ok(())
            }
        }
    }
}

/// rank features for a cohort; never errors, failures come back as `Unavailable`
pub fn explain(outcome: &FitOutcome, cohort: &[PatientRecord]) -> Importance {
    let model = match outcome {
        FitOutcome::Fitted(model) => model,
        FitOutcome::Failed(failure) => {
            return Importance::Unavailable(format!("model fit failed ({})", failure.cause));
        }
    };

    if cohort.is_empty() {
        return Importance::Unavailable("cohort is empty".to_string());
    }
    if !model.usable_for_importance() {
        return Importance::Unavailable("model has non-finite coefficients".to_string());
    }

    let design = match model.design_for(cohort) {
        Ok(design) => design,
        Err(e) => return Importance::Unavailable(e.to_string()),
    };

    match explain_design(model, design.view()) {
        Ok(ranking) => Importance::Available(ranking),
        Err(e) => Importance::Unavailable(e.to_string()),
    }
}

/// shapley values of the partial hazard for a design matrix, which also
/// serves as the background
pub fn explain_design(model: &HazardModel, covariates: ArrayView2<f64>) -> Result<ImportanceRanking> {
    let beta = model.coefficients();
    if covariates.ncols() != beta.len() {
        return Err(SurvivalError::invalid_dimensions(format!(
            "feature count mismatch: expected {}, got {}",
            beta.len(),
            covariates.ncols()
        )));
    }
    if covariates.nrows() == 0 {
        return Err(SurvivalError::invalid_survival_data("nothing to explain"));
    }

    // beta_j * (x_ij - mean_j), summing a row gives the log partial hazard
    let mut terms = covariates.to_owned();
    for mut row in terms.rows_mut() {
        row -= &model.means();
        row *= &beta;
    }
    let background = thin_background(&terms);

    let n_features = beta.len();
    let permutations = if n_features > MAX_EXACT_FEATURES {
        Some(feature_orderings(n_features, PERMUTATIONS))
    } else {
        None
    };

    let mut contributions = Array2::<f64>::zeros(terms.raw_dim());
    for (row, mut phi) in terms.rows().into_iter().zip(contributions.rows_mut()) {
        let values = match &permutations {
            None => exact_shapley(row, background.view()),
            Some(orders) => sampled_shapley(row, background.view(), orders),
        };
        phi.assign(&values);
    }

    let base_value = background
        .rows()
        .into_iter()
        .map(|c| c.sum().exp())
        .sum::<f64>()
        / background.nrows() as f64;

    if !base_value.is_finite() || contributions.iter().any(|v| !v.is_finite()) {
        return Err(SurvivalError::numerical_error("partial hazard overflowed while explaining"));
    }

    let mut features: Vec<FeatureContribution> = model
        .feature_names()
        .iter()
        .zip(contributions.axis_iter(Axis(1)))
        .map(|(name, column)| FeatureContribution {
            feature: name.clone(),
            score: column.mapv(f64::abs).mean().unwrap_or(0.0),
        })
        .collect();

    features.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.feature.cmp(&b.feature))
    });

    debug!(
        subjects = covariates.nrows(),
        background = background.nrows(),
        exact = permutations.is_none(),
        top = features.first().map(|c| c.feature.as_str()).unwrap_or(""),
        "computed feature importance"
    );

    Ok(ImportanceRanking {
        features,
        base_value,
        contributions,
    })
}

/// evenly spaced rows, all of them for small cohorts
fn thin_background(terms: &Array2<f64>) -> Array2<f64> {
    let n = terms.nrows();
    if n <= MAX_BACKGROUND {
        return terms.clone();
    }
    let picked: Vec<usize> = (0..MAX_BACKGROUND).map(|k| k * n / MAX_BACKGROUND).collect();
    terms.select(Axis(0), &picked)
}

fn feature_orderings(n_features: usize, count: usize) -> Vec<Vec<usize>> {
    let mut rng = StdRng::seed_from_u64(PERMUTATION_SEED);
    (0..count)
        .map(|_| {
            let mut order: Vec<usize> = (0..n_features).collect();
            order.shuffle(&mut rng);
            order
        })
        .collect()
}

/// exact values by enumerating all `2^p` coalitions, bit j of a mask = feature j
fn exact_shapley(subject: ArrayView1<f64>, background: ArrayView2<f64>) -> Array1<f64> {
    let p = subject.len();
    let size = 1usize << p;

    // value[mask] = mean over background of exp(sum of the mixed terms)
    let mut value = vec![0.0; size];
    let mut shift = vec![0.0; size];
    for c in background.rows() {
        let offset = c.sum();
        for mask in 1..size {
            let low = mask & mask.wrapping_neg();
            let j = low.trailing_zeros() as usize;
            shift[mask] = shift[mask ^ low] + subject[j] - c[j];
        }
        for (v, s) in value.iter_mut().zip(&shift) {
            *v += (offset + s).exp();
        }
    }
    let k = background.nrows() as f64;
    value.iter_mut().for_each(|v| *v /= k);

    // |S|! (p - |S| - 1)! / p!
    let weights: Vec<f64> = (0..p).map(|s| 1.0 / (p as f64 * binomial(p - 1, s))).collect();

    let mut phi = Array1::zeros(p);
    for mask in 0..size {
        let weight = weights.get(mask.count_ones() as usize).copied().unwrap_or(0.0);
        for j in 0..p {
            if mask & (1 << j) == 0 {
                phi[j] += weight * (value[mask | (1 << j)] - value[mask]);
            }
        }
    }
    phi
}

/// marginal contributions averaged over the given feature orderings
fn sampled_shapley(subject: ArrayView1<f64>, background: ArrayView2<f64>, orders: &[Vec<usize>]) -> Array1<f64> {
    let k = background.nrows() as f64;
    let offsets: Vec<f64> = background.rows().into_iter().map(|c| c.sum()).collect();
    let empty = offsets.iter().map(|o| o.exp()).sum::<f64>() / k;

    let mut phi = Array1::zeros(subject.len());
    let mut mixed = offsets.clone();
    for order in orders {
        mixed.copy_from_slice(&offsets);
        let mut previous = empty;
        for &j in order {
            let column = background.slice(s![.., j]);
            for (m, c) in mixed.iter_mut().zip(column) {
                *m += subject[j] - c;
            }
            let current = mixed.iter().map(|m| m.exp()).sum::<f64>() / k;
            phi[j] += current - previous;
            previous = current;
        }
    }
    phi / orders.len().max(1) as f64
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Covariate;
    use crate::model::{CoxModel, FailureCause, FitFailure};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn cohort() -> Vec<PatientRecord> {
        vec![
            PatientRecord::new("1", 45.0, "M", "I10", "medical", 5.0, true),
            PatientRecord::new("2", 52.0, "F", "E11", "surgical", 9.0, false),
            PatientRecord::new("3", 61.0, "M", "E11", "medical", 3.0, true),
            PatientRecord::new("4", 38.0, "F", "I10", "surgical", 12.0, true),
            PatientRecord::new("5", 70.0, "M", "I10", "surgical", 2.0, true),
            PatientRecord::new("6", 49.0, "F", "E11", "medical", 15.0, false),
            PatientRecord::new("7", 58.0, "F", "I10", "medical", 7.0, true),
            PatientRecord::new("8", 66.0, "M", "E11", "surgical", 4.0, false),
        ]
    }

    fn fitted() -> FitOutcome {
        CoxModel::new()
            .with_penalizer(0.1)
            .fit_cohort(&cohort(), &[Covariate::Age, Covariate::Sex, Covariate::DiagnosisCode])
    }

    #[test]
    fn test_ranking_sorted_and_complete() {
        let outcome = fitted();
        let importance = explain(&outcome, &cohort());
        let ranking = importance.ranking().expect("importance should be available");

        assert_eq!(ranking.len(), 3);
        for pair in ranking.features.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(ranking.features.iter().all(|c| c.score >= 0.0));
        assert_eq!(ranking.top(), ranking.features.first());
    }

    #[test]
    fn test_contributions_sum_to_partial_hazard() {
        let outcome = fitted();
        let model = outcome.model().unwrap();
        let design = model.design_for(&cohort()).unwrap();
        let ranking = explain_design(model, design.view()).unwrap();

        // efficiency: base + sum(phi_i) reproduces each subject's partial hazard
        let predictions = model.predict_partial_hazard(design.view()).unwrap();
        for (i, row) in ranking.contributions().rows().into_iter().enumerate() {
            assert_relative_eq!(ranking.base_value + row.sum(), predictions[i], epsilon = 1e-10);
        }

        let expected = predictions.mean().unwrap();
        assert_relative_eq!(ranking.base_value, expected, epsilon = 1e-10);
    }

    #[test]
    fn test_exact_values_for_two_features() {
        let (a1, a2) = (0.7_f64, -0.4_f64);
        let (c1, c2) = (-0.2_f64, 0.3_f64);
        let phi = exact_shapley(array![a1, a2].view(), array![[c1, c2]].view());

        let phi1 = 0.5 * ((a1 + c2).exp() - (c1 + c2).exp() + (a1 + a2).exp() - (c1 + a2).exp());
        let phi2 = 0.5 * ((c1 + a2).exp() - (c1 + c2).exp() + (a1 + a2).exp() - (a1 + c2).exp());
        assert_relative_eq!(phi[0], phi1, epsilon = 1e-12);
        assert_relative_eq!(phi[1], phi2, epsilon = 1e-12);
    }

    #[test]
    fn test_every_ordering_matches_enumeration() {
        let subject = array![0.5, -1.0, 0.25];
        let background = array![[0.1, 0.2, -0.3], [-0.4, 0.0, 0.6]];
        let orders = vec![
            vec![0, 1, 2],
            vec![0, 2, 1],
            vec![1, 0, 2],
            vec![1, 2, 0],
            vec![2, 0, 1],
            vec![2, 1, 0],
        ];

        let exact = exact_shapley(subject.view(), background.view());
        let sampled = sampled_shapley(subject.view(), background.view(), &orders);
        for j in 0..3 {
            assert_relative_eq!(sampled[j], exact[j], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_wide_design_is_deterministic_and_efficient() {
        use crate::data::SurvivalData;
        use rand::Rng;

        let mut rng = StdRng::seed_from_u64(3);
        let n_features = MAX_EXACT_FEATURES + 2;
        let covariates = Array2::<f64>::from_shape_fn((60, n_features), |_| rng.gen_range(-1.0..1.0));
        let mut times = Vec::new();
        let mut events = Vec::new();
        for i in 0..60 {
            let hazard = (0.8 * covariates[[i, 0]]).exp();
            times.push((-rng.r#gen::<f64>().ln() / hazard).max(0.05));
            events.push(i % 4 != 0);
        }
        let data = SurvivalData::new(times, events, covariates).unwrap();
        let model = CoxModel::new().with_penalizer(1.0).fit(&data).unwrap();

        let a = explain_design(&model, data.covariates()).unwrap();
        let b = explain_design(&model, data.covariates()).unwrap();
        assert_eq!(a, b);

        let predictions = model.predict_partial_hazard(data.covariates()).unwrap();
        for (i, row) in a.contributions().rows().into_iter().enumerate() {
            assert_relative_eq!(a.base_value + row.sum(), predictions[i], max_relative = 1e-9);
        }
    }

    #[test]
    fn test_background_is_thinned_evenly() {
        let terms = Array2::from_shape_fn((250, 2), |(i, j)| (i * 2 + j) as f64);
        let background = thin_background(&terms);
        assert_eq!(background.nrows(), MAX_BACKGROUND);
        assert_eq!(background[[0, 0]], 0.0);
        assert_eq!(background[[1, 0]], 4.0); // row 2
        assert_eq!(background[[99, 1]], (247 * 2 + 1) as f64);
    }

    #[test]
    fn test_unavailable_after_failed_fit() {
        let outcome = FitOutcome::Failed(FitFailure::new(FailureCause::Collinearity, "singular"));
        let importance = explain(&outcome, &cohort());
        assert!(!importance.is_available());
        assert!(importance.to_string().contains("collinearity"));
    }

    #[test]
    fn test_unavailable_for_empty_cohort() {
        let outcome = fitted();
        assert!(!explain(&outcome, &[]).is_available());
    }

    #[test]
    fn test_ties_broken_by_name() {
        // constant design -> every score is zero
        let outcome = fitted();
        let model = outcome.model().unwrap();
        let design = Array2::from_elem((4, 3), 1.0);
        let ranking = explain_design(model, design.view()).unwrap();

        let names: Vec<&str> = ranking.features.iter().map(|c| c.feature.as_str()).collect();
        assert_eq!(names, vec!["age", "diagnosis_code_I10", "sex_M"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let outcome = fitted();
        let model = outcome.model().unwrap();
        assert!(explain_design(model, Array2::zeros((2, 5)).view()).is_err());
    }
}
