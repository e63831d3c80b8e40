use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::{info, warn};

use crate::{
    data::SurvivalData,
    encoding::{Covariate, CovariateEncoder},
    error::{Result, SurvivalError},
    metrics::{harrell_c_index, likelihood_ratio_test, partial_aic, two_sided_p_value},
    optimization::{check_design_rank, invert, CoxOptimizer, OptimizationConfig, TieMethod},
    record::PatientRecord,
};

/// two-sided 95% normal quantile
const Z_95: f64 = 1.959_963_984_540_054;

/// cox model w/ optional ridge regularization - the fitter's configuration
#[derive(Debug, Clone)]
pub struct CoxModel {
    penalizer: f64,        // L2 strength on standardized coefficients
    max_iterations: usize, // newton budget
    tolerance: f64,        // convergence threshold
    ties: TieMethod,
}

impl Default for CoxModel {
    fn default() -> Self {
        Self {
            penalizer: 0.0,
            max_iterations: 100,
            tolerance: 1e-7,
            ties: TieMethod::Efron,
        }
    }
}

impl CoxModel {
    /// new cox model w/ defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// ridge penalty (L2) - shrinks coefficients, makes collinear designs fittable.
    /// negative or NaN values are treated as 0
    pub fn with_penalizer(mut self, penalizer: f64) -> Self {
        self.penalizer = penalizer.max(0.0);
        self
    }

    /// max newton iterations before giving up
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// how close is close enough for convergence
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_ties(mut self, ties: TieMethod) -> Self {
        self.ties = ties;
        self
    }

    pub fn penalizer(&self) -> f64 {
        self.penalizer
    }

    /// fit on patient records - never errors, failures come back tagged
    pub fn fit_cohort(&self, cohort: &[PatientRecord], covariates: &[Covariate]) -> FitOutcome {
        let outcome = self.try_fit_cohort(cohort, covariates);
        if let FitOutcome::Failed(failure) = &outcome {
            warn!(cause = %failure.cause, message = %failure.message, "cox model fit failed");
        }
        outcome
    }

    fn try_fit_cohort(&self, cohort: &[PatientRecord], covariates: &[Covariate]) -> FitOutcome {
        if cohort.is_empty() {
            return FitOutcome::failed(FailureCause::EmptyCohort, "no patients match the current filters");
        }

        let encoder = CovariateEncoder::fit(cohort, covariates);
        if encoder.n_features() == 0 {
            return FitOutcome::failed(
                FailureCause::NoCovariates,
                "every selected covariate is constant in this cohort",
            );
        }

        let data = match encoder.survival_data(cohort) {
            Ok(data) => data,
            Err(e) => return FitOutcome::Failed(FitFailure::from_error(e)),
        };

        if data.n_events() == 0 {
            return FitOutcome::failed(FailureCause::InsufficientSamples, "no observed events in this cohort");
        }

        if self.penalizer == 0.0 && data.n_samples() <= data.n_features() {
            return FitOutcome::failed(
                FailureCause::InsufficientSamples,
                format!(
                    "{} patients for {} encoded covariates",
                    data.n_samples(),
                    data.n_features()
                ),
            );
        }

        match self.fit(&data) {
            Ok(model) => FitOutcome::Fitted(Box::new(model.with_encoder(encoder))),
            Err(e) => FitOutcome::Failed(FitFailure::from_error(e)),
        }
    }

    /// fit the model to an already encoded design - this does the actual work
    pub fn fit(&self, data: &SurvivalData) -> Result<HazardModel> {
        if data.n_samples() == 0 {
            return Err(SurvivalError::invalid_survival_data("can't fit an empty dataset"));
        }
        if !(self.tolerance > 0.0) {
            return Err(SurvivalError::invalid_parameter("tolerance", self.tolerance.to_string()));
        }

        // work on the standardized scale, transform back at the end
        let mut standardized = data.clone();
        let (means, scales) = standardized.standardize_covariates()?;
        check_design_rank(standardized.covariates(), self.penalizer)?;

        let optimizer = CoxOptimizer::new(OptimizationConfig {
            l2_penalty: self.penalizer,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            ties: self.ties,
        });

        let solution = optimizer.optimize(&standardized)?;
        let null_log_likelihood = optimizer.log_likelihood(&standardized, &Array1::zeros(data.n_features()))?;
        let covariance_std = invert(&solution.information)?;

        let p = data.n_features();
        let coefficients = &solution.beta / &scales;
        let covariance = Array2::from_shape_fn((p, p), |(a, b)| covariance_std[[a, b]] / (scales[a] * scales[b]));
        let standard_errors = covariance.diag().mapv(|v| v.max(0.0).sqrt());

        // centred linear predictor for concordance & the baseline hazard
        let linear_predictor = centred_linear_predictor(data.covariates(), &means, &coefficients);
        let concordance = harrell_c_index(linear_predictor.view(), data.times(), data.events()).ok();
        let baseline = BaselineHazard::breslow(data, &linear_predictor);

        let (likelihood_ratio, likelihood_ratio_p) =
            likelihood_ratio_test(solution.log_likelihood, null_log_likelihood, p);

        let statistics = FitStatistics {
            n_samples: data.n_samples(),
            n_events: data.n_events(),
            log_likelihood: solution.log_likelihood,
            null_log_likelihood,
            partial_aic: partial_aic(solution.log_likelihood, p),
            likelihood_ratio,
            likelihood_ratio_df: p,
            likelihood_ratio_p,
            concordance,
            iterations: solution.iterations,
        };

        info!(
            samples = statistics.n_samples,
            events = statistics.n_events,
            features = p,
            iterations = statistics.iterations,
            log_likelihood = statistics.log_likelihood,
            "cox model converged"
        );

        Ok(HazardModel {
            feature_names: data.feature_names().to_vec(),
            coefficients,
            standard_errors,
            covariance,
            means,
            baseline,
            statistics,
            penalizer: self.penalizer,
            encoder: None,
        })
    }
}

fn centred_linear_predictor(x: ArrayView2<f64>, means: &Array1<f64>, beta: &Array1<f64>) -> Array1<f64> {
    x.dot(beta) - means.dot(beta)
}

/// why a fit didn't produce a usable model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    EmptyCohort,
    NoCovariates,
    InsufficientSamples, // too few rows or events for the encoded dimensionality
    Collinearity,        // rank-deficient design or information matrix
    NotConverged,        // iteration budget, line search or numerical trouble
    InvalidData,
}

impl FailureCause {
    /// what the caller can try next
    pub fn hint(&self) -> &'static str {
        match self {
            FailureCause::EmptyCohort => "widen the filters",
            FailureCause::NoCovariates => "select covariates that vary within the cohort",
            FailureCause::InsufficientSamples => "widen the filters, drop covariates, or add a penalizer",
            FailureCause::Collinearity => "increase the penalizer or drop a redundant covariate",
            FailureCause::NotConverged => "increase the penalizer or the iteration budget",
            FailureCause::InvalidData => "check the durations and covariates of the input",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCause::EmptyCohort => "empty cohort",
            FailureCause::NoCovariates => "no covariates",
            FailureCause::InsufficientSamples => "insufficient samples",
            FailureCause::Collinearity => "collinearity",
            FailureCause::NotConverged => "did not converge",
            FailureCause::InvalidData => "invalid data",
        };
        f.write_str(name)
    }
}

/// tagged fit failure - a normal result, not an error
#[derive(Debug, Clone, PartialEq)]
pub struct FitFailure {
    pub cause: FailureCause,
    pub message: String,
}

impl FitFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }

    fn from_error(error: SurvivalError) -> Self {
        let cause = match &error {
            SurvivalError::SingularMatrix { .. } => FailureCause::Collinearity,
            SurvivalError::InvalidDimensions { .. } | SurvivalError::InvalidSurvivalData { .. } => {
                FailureCause::InvalidData
            }
            _ => FailureCause::NotConverged,
        };
        Self::new(cause, error.to_string())
    }
}

impl fmt::Display for FitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.cause, self.message, self.cause.hint())
    }
}

/// result of fitting on a cohort
#[derive(Debug, Clone)]
pub enum FitOutcome {
    Fitted(Box<HazardModel>),
    Failed(FitFailure),
}

impl FitOutcome {
    fn failed(cause: FailureCause, message: impl Into<String>) -> Self {
        FitOutcome::Failed(FitFailure::new(cause, message))
    }

    pub fn model(&self) -> Option<&HazardModel> {
        match self {
            FitOutcome::Fitted(model) => Some(model.as_ref()),
            FitOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FitFailure> {
        match self {
            FitOutcome::Fitted(_) => None,
            FitOutcome::Failed(failure) => Some(failure),
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self, FitOutcome::Fitted(_))
    }
}

/// breslow estimate of the baseline cumulative hazard (at mean covariates)
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineHazard {
    pub times: Vec<f64>,             // distinct event times, ascending
    pub cumulative_hazard: Vec<f64>, // H0 at each of those times
}

impl BaselineHazard {
    fn breslow(data: &SurvivalData, linear_predictor: &Array1<f64>) -> Self {
        let times = data.times();
        let events = data.events();
        let order = data.descending_time_order();
        let n = order.len();

        // walk latest -> earliest accumulating the risk-set sum
        let mut increments: Vec<(f64, f64)> = Vec::new();
        let mut risk_sum = 0.0;
        let mut k = 0;
        while k < n {
            let t = times[order[k]];
            let mut deaths = 0usize;
            while k < n && times[order[k]] == t {
                let i = order[k];
                risk_sum += linear_predictor[i].exp();
                if events[i] {
                    deaths += 1;
                }
                k += 1;
            }
            if deaths > 0 && risk_sum > 0.0 {
                increments.push((t, deaths as f64 / risk_sum));
            }
        }
        increments.reverse();

        let mut cumulative = 0.0;
        let mut baseline = Self {
            times: Vec::with_capacity(increments.len()),
            cumulative_hazard: Vec::with_capacity(increments.len()),
        };
        for (t, dh) in increments {
            cumulative += dh;
            baseline.times.push(t);
            baseline.cumulative_hazard.push(cumulative);
        }
        baseline
    }

    /// H0(t), right-continuous step lookup
    pub fn at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&x| x <= t);
        if idx == 0 {
            0.0
        } else {
            self.cumulative_hazard[idx - 1]
        }
    }
}

/// model-level statistics
#[derive(Debug, Clone, PartialEq)]
pub struct FitStatistics {
    pub n_samples: usize,
    pub n_events: usize,
    pub log_likelihood: f64,      // unpenalized log partial likelihood at the estimate
    pub null_log_likelihood: f64, // same, all betas zero
    pub partial_aic: f64,
    pub likelihood_ratio: f64,
    pub likelihood_ratio_df: usize,
    pub likelihood_ratio_p: f64,
    pub concordance: Option<f64>, // harrell, None without comparable pairs
    pub iterations: usize,
}

/// one row of the summary table
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientSummary {
    pub covariate: String,
    pub coef: f64,
    pub hazard_ratio: f64,
    pub se: f64,
    pub coef_lower_95: f64,
    pub coef_upper_95: f64,
    pub hazard_ratio_lower_95: f64,
    pub hazard_ratio_upper_95: f64,
    pub z: f64,
    pub p: f64,
}

/// what a successful fit learned
#[derive(Debug, Clone)]
pub struct HazardModel {
    feature_names: Vec<String>,
    coefficients: Array1<f64>,    // log hazard ratios, original covariate scale
    standard_errors: Array1<f64>, // same scale
    covariance: Array2<f64>,
    means: Array1<f64>, // covariate means of the fitting data
    baseline: BaselineHazard,
    statistics: FitStatistics,
    penalizer: f64,
    encoder: Option<CovariateEncoder>, // present when fit from patient records
}

impl HazardModel {
    fn with_encoder(mut self, encoder: CovariateEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    /// the fitted coefficients (betas)
    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    /// exp(beta) per covariate
    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.coefficients.mapv(f64::exp)
    }

    pub fn standard_errors(&self) -> ArrayView1<'_, f64> {
        self.standard_errors.view()
    }

    pub fn covariance(&self) -> ArrayView2<'_, f64> {
        self.covariance.view()
    }

    pub fn means(&self) -> ArrayView1<'_, f64> {
        self.means.view()
    }

    pub fn baseline(&self) -> &BaselineHazard {
        &self.baseline
    }

    pub fn statistics(&self) -> &FitStatistics {
        &self.statistics
    }

    pub fn penalizer(&self) -> f64 {
        self.penalizer
    }

    pub fn encoder(&self) -> Option<&CovariateEncoder> {
        self.encoder.as_ref()
    }

    /// good enough to feed the importance explainer?
    pub fn usable_for_importance(&self) -> bool {
        self.coefficients.iter().all(|v| v.is_finite()) && self.standard_errors.iter().all(|v| v.is_finite())
    }

    /// per-covariate coefficient table
    pub fn summary(&self) -> Vec<CoefficientSummary> {
        self.feature_names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let coef = self.coefficients[j];
                let se = self.standard_errors[j];
                let z = if se > 0.0 { coef / se } else { f64::NAN };
                let (lower, upper) = (coef - Z_95 * se, coef + Z_95 * se);
                CoefficientSummary {
                    covariate: name.clone(),
                    coef,
                    hazard_ratio: coef.exp(),
                    se,
                    coef_lower_95: lower,
                    coef_upper_95: upper,
                    hazard_ratio_lower_95: lower.exp(),
                    hazard_ratio_upper_95: upper.exp(),
                    z,
                    p: two_sided_p_value(z),
                }
            })
            .collect()
    }

    /// encode patient records the way the model was fit
    pub fn design_for(&self, cohort: &[PatientRecord]) -> Result<Array2<f64>> {
        match &self.encoder {
            Some(encoder) => Ok(encoder.encode(cohort)),
            None => Err(SurvivalError::invalid_parameter(
                "encoder",
                "model was fit on a raw design matrix",
            )),
        }
    }

    /// (x - mean) . beta per row
    pub fn predict_log_partial_hazard(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        if covariates.ncols() != self.coefficients.len() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "feature count mismatch: expected {}, got {}",
                self.coefficients.len(),
                covariates.ncols()
            )));
        }
        Ok(centred_linear_predictor(covariates, &self.means, &self.coefficients))
    }

    /// exp of the log partial hazard
    pub fn predict_partial_hazard(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        Ok(self.predict_log_partial_hazard(covariates)?.mapv(f64::exp))
    }

    /// S(t | x) = exp(-H0(t) * partial hazard), one row per subject, one column per time
    pub fn predict_survival(&self, covariates: ArrayView2<f64>, times: ArrayView1<f64>) -> Result<Array2<f64>> {
        let partial_hazard = self.predict_partial_hazard(covariates)?;
        let baseline: Vec<f64> = times.iter().map(|&t| self.baseline.at(t)).collect();

        Ok(Array2::from_shape_fn((partial_hazard.len(), times.len()), |(i, k)| {
            (-baseline[k] * partial_hazard[i]).exp()
        }))
    }
}

impl fmt::Display for HazardModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.statistics;
        writeln!(f, "cox proportional hazards model")?;
        writeln!(f, "==============================")?;
        writeln!(f, "penalizer:          {:.6}", self.penalizer)?;
        writeln!(f, "observations:       {}", stats.n_samples)?;
        writeln!(f, "events observed:    {}", stats.n_events)?;
        writeln!(f, "log-likelihood:     {:.4}", stats.log_likelihood)?;
        match stats.concordance {
            Some(c) => writeln!(f, "concordance:        {c:.4}")?,
            None => writeln!(f, "concordance:        n/a")?,
        }
        writeln!(f, "partial AIC:        {:.4}", stats.partial_aic)?;
        writeln!(
            f,
            "log-likelihood ratio test: {:.4} on {} df, p = {:.4}",
            stats.likelihood_ratio, stats.likelihood_ratio_df, stats.likelihood_ratio_p
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "{:<28} {:>10} {:>10} {:>10} {:>8} {:>8}",
            "covariate", "coef", "exp(coef)", "se(coef)", "z", "p"
        )?;
        writeln!(f, "{:-<79}", "")?;
        for row in self.summary() {
            writeln!(
                f,
                "{:<28} {:>10.4} {:>10.4} {:>10.4} {:>8.3} {:>8.4}",
                row.covariate, row.coef, row.hazard_ratio, row.se, row.z, row.p
            )?;
        }
        Ok(())
    }
}
