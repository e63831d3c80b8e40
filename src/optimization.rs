use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    data::SurvivalData,
    error::{Result, SurvivalError},
};

/// how many times a newton step gets halved before we give up on it
const MAX_STEP_HALVINGS: usize = 30;

/// relative pivot size below which a matrix counts as singular
const SINGULAR_PIVOT: f64 = 1e-10;

/// largest |beta| on the standardized scale before the fit counts as diverging
const DIVERGENCE_BOUND: f64 = 15.0;

/// how tied event times enter the partial likelihood
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieMethod {
    #[default]
    Efron,
    Breslow,
}

/// Configuration for Cox model optimization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub l2_penalty: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub ties: TieMethod,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            l2_penalty: 0.0,
            max_iterations: 100,
            tolerance: 1e-7,
            ties: TieMethod::Efron,
        }
    }
}

/// where newton-raphson ended up
#[derive(Debug, Clone)]
pub struct Solution {
    pub beta: Array1<f64>,
    pub log_likelihood: f64,           // unpenalized, at beta
    pub penalized_log_likelihood: f64, // what was actually maximised
    pub information: Array2<f64>,      // negative hessian of the penalized objective
    pub iterations: usize,
}

/// log partial likelihood with its first & second derivatives
#[derive(Debug, Clone)]
struct Derivatives {
    loglik: f64,
    gradient: Array1<f64>,
    hessian: Array2<f64>,
}

/// Cox proportional hazards optimizer with ridge regularization
pub struct CoxOptimizer {
    config: OptimizationConfig,
}

impl CoxOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// maximise the penalized partial likelihood by newton-raphson w/ step halving
    ///
    /// a singular information matrix comes back as `SingularMatrix`. running
    /// out of iterations or step halvings, or coefficients running off to
    /// infinity (a separated cohort), comes back as `OptimizationFailed`.
    ///
    /// convergence needs a small newton step. a flat likelihood alone isn't
    /// enough since under separation it flattens while beta keeps growing.
    pub fn optimize(&self, data: &SurvivalData) -> Result<Solution> {
        let l2 = self.config.l2_penalty;
        let tolerance = self.config.tolerance;
        let mut beta = Array1::zeros(data.n_features());
        let mut current = self.penalized_derivatives(data, &beta)?;

        for iteration in 0..self.config.max_iterations {
            let information = current.hessian.mapv(|v| -v);
            let delta = match solve_linear_system(&information, &current.gradient) {
                Ok(delta) => delta,
                // curvature vanishes along a separating direction
                Err(SurvivalError::SingularMatrix { .. }) if max_abs(&beta) > 0.5 * DIVERGENCE_BOUND => {
                    return Err(diverging(&beta));
                }
                Err(err) => return Err(err),
            };

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = &beta + &(step * &delta);
                match self.penalized_derivatives(data, &candidate) {
                    Ok(next) if next.loglik.is_finite() && next.loglik >= current.loglik - 1e-12 => {
                        accepted = Some((candidate, next));
                        break;
                    }
                    _ => step *= 0.5,
                }
            }

            let Some((candidate, next)) = accepted else {
                return Err(SurvivalError::optimization_failed(
                    "line search couldn't improve the partial likelihood",
                ));
            };

            let change = (next.loglik - current.loglik).abs();
            let max_move = max_abs(&delta) * step;
            beta = candidate;
            current = next;

            trace!(iteration, loglik = current.loglik, step, max_move, "newton step");

            if max_abs(&beta) > DIVERGENCE_BOUND {
                return Err(diverging(&beta));
            }
            if max_move < tolerance || (change < tolerance && max_move < tolerance.sqrt()) {
                let penalty = 0.5 * l2 * beta.dot(&beta);
                return Ok(Solution {
                    log_likelihood: current.loglik + penalty,
                    penalized_log_likelihood: current.loglik,
                    information: current.hessian.mapv(|v| -v),
                    iterations: iteration + 1,
                    beta,
                });
            }
        }

        Err(SurvivalError::optimization_failed(format!(
            "newton-raphson didn't converge in {} iterations",
            self.config.max_iterations
        )))
    }

    /// unpenalized log partial likelihood at `beta`
    pub fn log_likelihood(&self, data: &SurvivalData, beta: &Array1<f64>) -> Result<f64> {
        Ok(self.likelihood_derivatives(data, beta)?.loglik)
    }

    fn penalized_derivatives(&self, data: &SurvivalData, beta: &Array1<f64>) -> Result<Derivatives> {
        let mut d = self.likelihood_derivatives(data, beta)?;
        let l2 = self.config.l2_penalty;

        if l2 > 0.0 {
            d.loglik -= 0.5 * l2 * beta.dot(beta);
            d.gradient.scaled_add(-l2, beta);
            for j in 0..beta.len() {
                d.hessian[[j, j]] -= l2;
            }
        }

        Ok(d)
    }

    /// one pass over the samples, latest time first, so risk-set sums just accumulate
    fn likelihood_derivatives(&self, data: &SurvivalData, beta: &Array1<f64>) -> Result<Derivatives> {
        let n = data.n_samples();
        let p = data.n_features();
        let x = data.covariates();
        let times = data.times();
        let events = data.events();

        let eta = x.dot(beta);
        if eta.iter().any(|v| !v.is_finite()) {
            return Err(SurvivalError::numerical_error("linear predictor isn't finite"));
        }
        // shift so the largest weight is 1 - cancels out of every ratio below
        let eta_max = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let eta_max = if eta_max.is_finite() { eta_max } else { 0.0 };
        let weights = eta.mapv(|e| (e - eta_max).exp());

        let mut loglik = 0.0;
        let mut gradient = Array1::zeros(p);
        let mut hessian = Array2::zeros((p, p));

        // risk set sums
        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut s2 = Array2::<f64>::zeros((p, p));

        let order = data.descending_time_order();
        let mut k = 0;

        while k < n {
            let t = times[order[k]];

            // tied events at t
            let mut deaths = 0usize;
            let mut t0 = 0.0;
            let mut t1 = Array1::<f64>::zeros(p);
            let mut t2 = Array2::<f64>::zeros((p, p));

            let mut m = k;
            while m < n && times[order[m]] == t {
                let i = order[m];
                let xi = x.row(i);
                let wi = weights[i];

                s0 += wi;
                s1.scaled_add(wi, &xi);
                add_outer(&mut s2, wi, xi);

                if events[i] {
                    deaths += 1;
                    t0 += wi;
                    t1.scaled_add(wi, &xi);
                    add_outer(&mut t2, wi, xi);
                    loglik += eta[i];
                    gradient += &xi;
                }
                m += 1;
            }

            for l in 0..deaths {
                let frac = match self.config.ties {
                    TieMethod::Efron => l as f64 / deaths as f64,
                    TieMethod::Breslow => 0.0,
                };

                let phi0 = s0 - frac * t0;
                if !(phi0 > 0.0) || !phi0.is_finite() {
                    return Err(SurvivalError::numerical_error("risk set sum is non-positive"));
                }

                let mean = (&s1 - &(frac * &t1)) / phi0;
                loglik -= phi0.ln() + eta_max;
                gradient -= &mean;

                for a in 0..p {
                    for b in 0..p {
                        let second = (s2[[a, b]] - frac * t2[[a, b]]) / phi0;
                        hessian[[a, b]] -= second - mean[a] * mean[b];
                    }
                }
            }

            k = m;
        }

        if !loglik.is_finite() {
            return Err(SurvivalError::numerical_error("log partial likelihood isn't finite"));
        }

        Ok(Derivatives {
            loglik,
            gradient,
            hessian,
        })
    }
}

fn max_abs(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
}

fn diverging(beta: &Array1<f64>) -> SurvivalError {
    SurvivalError::optimization_failed(format!(
        "coefficients are diverging (max |beta| {:.1} on the standardized scale), \
         a covariate likely separates events from censored rows",
        max_abs(beta)
    ))
}

fn add_outer(acc: &mut Array2<f64>, weight: f64, x: ArrayView1<f64>) {
    let p = x.len();
    for a in 0..p {
        let wa = weight * x[a];
        for b in 0..p {
            acc[[a, b]] += wa * x[b];
        }
    }
}

/// fails with `SingularMatrix` when `XᵀX / n + λI` of a (standardized)
/// design matrix isn't invertible, i.e. the covariates are collinear or
/// there are too few rows for the number of columns
pub fn check_design_rank(x: ArrayView2<f64>, l2_penalty: f64) -> Result<()> {
    let n = x.nrows().max(1) as f64;
    let mut gram = x.t().dot(&x) / n;
    for j in 0..gram.nrows() {
        gram[[j, j]] += l2_penalty;
    }

    let rhs = Array1::zeros(gram.nrows());
    solve_linear_system(&gram, &rhs).map(|_| ())
}

/// solve Ax = b via gaussian elimination w/ partial pivoting
pub fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(SurvivalError::invalid_dimensions("matrix dimensions mismatch"));
    }

    let rhs = b
        .clone()
        .into_shape((n, 1))
        .map_err(|e| SurvivalError::invalid_dimensions(e.to_string()))?;
    let x = gauss_jordan(a, rhs)?;
    Ok(x.column(0).to_owned())
}

/// inverse of a square matrix
pub fn invert(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(SurvivalError::invalid_dimensions("can only invert square matrices"));
    }
    gauss_jordan(a, Array2::eye(n))
}

/// reduce [a | rhs] until a is the identity; rhs then holds a⁻¹·rhs
fn gauss_jordan(a: &Array2<f64>, mut rhs: Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    let mut a = a.clone();
    let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let threshold = SINGULAR_PIVOT * scale;

    for i in 0..n {
        // find pivot
        let mut max_row = i;
        for k in i + 1..n {
            if a[[k, i]].abs() > a[[max_row, i]].abs() {
                max_row = k;
            }
        }

        if !(a[[max_row, i]].abs() > threshold) {
            return Err(SurvivalError::singular_matrix(format!(
                "pivot {} is ~0 (column {})",
                a[[max_row, i]],
                i
            )));
        }

        if max_row != i {
            for j in 0..n {
                a.swap([i, j], [max_row, j]);
            }
            for j in 0..rhs.ncols() {
                rhs.swap([i, j], [max_row, j]);
            }
        }

        let pivot = a[[i, i]];
        for j in 0..n {
            a[[i, j]] /= pivot;
        }
        for j in 0..rhs.ncols() {
            rhs[[i, j]] /= pivot;
        }

        for k in 0..n {
            if k == i {
                continue;
            }
            let factor = a[[k, i]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[[k, j]] -= factor * a[[i, j]];
            }
            for j in 0..rhs.ncols() {
                rhs[[k, j]] -= factor * rhs[[i, j]];
            }
        }
    }

    Ok(rhs)
}
