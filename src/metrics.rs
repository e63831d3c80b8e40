use ndarray::ArrayView1;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::erfc;

use crate::error::{Result, SurvivalError};

/// Harrell's C-index - how often do higher risk scores go with shorter survival?
///
/// a pair (i, j) is comparable when i had an event and j was still at risk
/// past i's time. tied risk scores count as half-concordant.
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() {
        return Err(SurvivalError::invalid_dimensions(
            "risk scores, times, and events must have same length",
        ));
    }

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue;
        }

        for j in 0..n {
            if i == j {
                continue;
            }

            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(SurvivalError::numerical_error(
            "no comparable pairs for C-index calculation",
        ));
    }

    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

/// partial AIC = -2 ll + 2 k
pub fn partial_aic(log_likelihood: f64, n_parameters: usize) -> f64 {
    2.0 * n_parameters as f64 - 2.0 * log_likelihood
}

/// likelihood-ratio test of a fitted model against the null (all betas zero)
///
/// returns the chi-squared statistic and its p-value on `df` degrees of freedom
pub fn likelihood_ratio_test(log_likelihood: f64, null_log_likelihood: f64, df: usize) -> (f64, f64) {
    let statistic = (2.0 * (log_likelihood - null_log_likelihood)).max(0.0);
    let p_value = ChiSquared::new(df as f64)
        .map(|dist| 1.0 - dist.cdf(statistic))
        .unwrap_or(f64::NAN);
    (statistic, p_value)
}

/// two-sided p-value of a standard normal z statistic
pub fn two_sided_p_value(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    erfc(z.abs() / std::f64::consts::SQRT_2)
}
