use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use tracing::debug;

use crate::error::{Result, SurvivalError};

/// survival data - times, events, and the encoded covariate matrix
#[derive(Debug, Clone)]
pub struct SurvivalData {
    times: Array1<f64>,         // time to event/censoring
    events: Vec<bool>,          // true = event, false = censored
    covariates: Array2<f64>,    // n_samples x n_features
    feature_names: Vec<String>, // one per covariate column
}

impl SurvivalData {
    /// make new survival data from raw vecs/arrays, features get `x0, x1, ..` names
    pub fn new(times: Vec<f64>, events: Vec<bool>, covariates: Array2<f64>) -> Result<Self> {
        let names = (0..covariates.ncols()).map(|j| format!("x{j}")).collect();
        Self::with_feature_names(times, events, covariates, names)
    }

    pub fn with_feature_names(
        times: Vec<f64>,
        events: Vec<bool>,
        covariates: Array2<f64>,
        feature_names: Vec<String>,
    ) -> Result<Self> {
        let n_samples = times.len();

        if events.len() != n_samples {
            return Err(SurvivalError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                n_samples,
                events.len()
            )));
        }

        if covariates.nrows() != n_samples {
            return Err(SurvivalError::invalid_dimensions(format!(
                "covariates rows ({}) != n_samples ({})",
                covariates.nrows(),
                n_samples
            )));
        }

        if feature_names.len() != covariates.ncols() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "feature names ({}) != covariate columns ({})",
                feature_names.len(),
                covariates.ncols()
            )));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(
                "survival times must be non-negative & finite",
            ));
        }

        if covariates.iter().any(|v| !v.is_finite()) {
            return Err(SurvivalError::invalid_survival_data("covariates must be finite"));
        }

        Ok(Self {
            times: Array1::from(times),
            events,
            covariates,
            feature_names,
        })
    }

    /// how many patients
    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    /// how many covariate columns
    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    /// how many observed events
    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    pub fn events(&self) -> &[bool] {
        &self.events
    }

    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// sample indices ordered by time, latest first (risk sets grow as we walk)
    pub fn descending_time_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.n_samples()).collect();
        order.sort_by(|&a, &b| self.times[b].total_cmp(&self.times[a]));
        order
    }

    /// standardize features (mean=0, std=1) in place, returns (means, scales)
    ///
    /// zero-variance columns are only centred (scale 1) so they end up as all
    /// zeros; catching the resulting rank deficiency is the fitter's job.
    pub fn standardize_covariates(&mut self) -> Result<(Array1<f64>, Array1<f64>)> {
        if self.n_samples() == 0 {
            return Err(SurvivalError::invalid_survival_data("can't standardize an empty matrix"));
        }

        let means = self
            .covariates
            .mean_axis(Axis(0))
            .ok_or_else(|| SurvivalError::numerical_error("mean of empty axis"))?;
        let stds = self.covariates.std_axis(Axis(0), 0.0);

        let scales = stds.mapv(|s| if s > 1e-12 { s } else { 1.0 });
        for (j, &s) in stds.iter().enumerate() {
            if s <= 1e-12 {
                debug!(feature = %self.feature_names[j], "zero-variance covariate, centring only");
            }
        }

        for mut row in self.covariates.rows_mut() {
            row -= &means;
            row /= &scales;
        }

        Ok((means, scales))
    }
}
