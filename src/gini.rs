//! Gini coefficient of a feature's log counts and the linear EDF ~ Gini
//! relation used to predict smoother complexity without a full fit.
use ndarray::ArrayView1;
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

/// Confidence level of the upper bound used for EDF predictions.
pub const EDF_CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GiniError {
    #[error("Need at least 3 (gini, edf) pairs to fit the EDF model, got {0}")]
    TooFewPoints(usize),
    #[error("Gini coefficients have no spread; slope is not identifiable")]
    NoSpread,
    #[error("Non-finite value in EDF model input")]
    NonFinite,
}

/// Area-based Gini coefficient with uniform weights.
///
/// Returns 0 for an empty, constant or all-zero vector.
pub fn gini(x: ArrayView1<'_, f64>) -> f64 {
    let n = x.len();
    if n == 0 {
        return 0.0;
    }
    let mut sorted: Vec<f64> = x.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let total: f64 = sorted.iter().sum();
    if total == 0.0 || !total.is_finite() {
        return 0.0;
    }

    // p[i] = (i + 1) / n, nu[i] = cumulative share of the total
    let mut cum = 0.0;
    let nu: Vec<f64> = sorted
        .iter()
        .map(|v| {
            cum += v;
            cum / total
        })
        .collect();
    let p = |i: usize| (i + 1) as f64 / n as f64;

    let mut lead = 0.0;
    let mut lag = 0.0;
    for i in 1..n {
        lead += nu[i] * p(i - 1);
        lag += nu[i - 1] * p(i);
    }
    lead - lag
}

/// Gini coefficient of `ln(count + 1)`.
pub fn log_count_gini(counts: ArrayView1<'_, f64>) -> f64 {
    gini(counts.mapv(f64::ln_1p).view())
}

/// Ordinary least squares fit of `edf = intercept + slope * gini`.
#[derive(Debug, Clone)]
pub struct EdfGiniModel {
    pub intercept: f64,
    pub slope: f64,
    n: usize,
    mean_gini: f64,
    sxx: f64,
    residual_se: f64,
    t_quantile: f64,
}

impl EdfGiniModel {
    pub fn fit(points: &[(f64, f64)]) -> Result<Self, GiniError> {
        let n = points.len();
        if n < 3 {
            return Err(GiniError::TooFewPoints(n));
        }
        if points.iter().any(|(g, e)| !g.is_finite() || !e.is_finite()) {
            return Err(GiniError::NonFinite);
        }

        let nf = n as f64;
        let mean_gini = points.iter().map(|(g, _)| g).sum::<f64>() / nf;
        let mean_edf = points.iter().map(|(_, e)| e).sum::<f64>() / nf;
        let sxx: f64 = points.iter().map(|(g, _)| (g - mean_gini).powi(2)).sum();
        let sxy: f64 = points.iter().map(|(g, e)| (g - mean_gini) * (e - mean_edf)).sum();
        if sxx <= f64::EPSILON {
            return Err(GiniError::NoSpread);
        }

        let slope = sxy / sxx;
        let intercept = mean_edf - slope * mean_gini;
        let rss: f64 = points
            .iter()
            .map(|(g, e)| (e - intercept - slope * g).powi(2))
            .sum();
        let residual_se = (rss / (nf - 2.0)).sqrt();

        let t_dist = StudentsT::new(0.0, 1.0, nf - 2.0).map_err(|_| GiniError::NonFinite)?;
        let t_quantile = t_dist.inverse_cdf(0.5 + EDF_CONFIDENCE_LEVEL / 2.0);

        log::info!(
            "EDF ~ Gini fit on {} features: edf = {:.3} + {:.3} * gini (residual SE {:.3})",
            n,
            intercept,
            slope,
            residual_se
        );

        Ok(Self { intercept, slope, n, mean_gini, sxx, residual_se, t_quantile })
    }

    pub fn predict(&self, gini: f64) -> f64 {
        self.intercept + self.slope * gini
    }

    /// Upper end of the confidence interval for the fitted mean EDF at `gini`.
    pub fn predict_upper(&self, gini: f64) -> f64 {
        let se_fit = self.residual_se
            * (1.0 / self.n as f64 + (gini - self.mean_gini).powi(2) / self.sxx).sqrt();
        self.predict(gini) + self.t_quantile * se_fit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::{array, Array1};

    #[test]
    fn test_constant_vector_has_zero_gini() {
        assert_abs_diff_eq!(gini(array![3.0, 3.0, 3.0, 3.0].view()), 0.0, epsilon = 1e-12);
        assert_eq!(gini(array![0.0, 0.0].view()), 0.0);
        assert_eq!(gini(Array1::<f64>::zeros(0).view()), 0.0);
    }

    #[test]
    fn test_gini_is_scale_invariant() {
        let x = array![0.0, 1.0, 4.0, 2.0, 9.0, 0.5];
        let scaled = x.mapv(|v| v * 7.5);
        assert_relative_eq!(gini(x.view()), gini(scaled.view()), epsilon = 1e-12);
    }

    #[test]
    fn test_gini_of_single_holder() {
        // one of n holds everything: (n - 1) / n
        let x = array![0.0, 0.0, 0.0, 10.0];
        assert_relative_eq!(gini(x.view()), 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_gini_order_independent() {
        let a = array![5.0, 1.0, 3.0, 0.0];
        let b = array![0.0, 3.0, 5.0, 1.0];
        assert_relative_eq!(gini(a.view()), gini(b.view()), epsilon = 1e-12);
    }

    #[test]
    fn test_edf_model_recovers_exact_line() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| {
            let g = i as f64 / 10.0;
            (g, 5.0 + 20.0 * g)
        }).collect();
        let model = EdfGiniModel::fit(&points).unwrap();
        assert_relative_eq!(model.slope, 20.0, epsilon = 1e-9);
        assert_relative_eq!(model.intercept, 5.0, epsilon = 1e-9);
        // no residual spread, so the upper bound equals the fit
        assert_relative_eq!(model.predict_upper(0.35), 12.0, epsilon = 1e-9);
    }

    #[test]
    fn test_upper_bound_exceeds_fit_with_noise() {
        let points = vec![(0.1, 8.0), (0.2, 9.5), (0.3, 13.0), (0.4, 14.0), (0.5, 18.5), (0.6, 19.0)];
        let model = EdfGiniModel::fit(&points).unwrap();
        for g in [0.0, 0.35, 0.9] {
            assert!(model.predict_upper(g) > model.predict(g));
        }
        // interval is narrowest at the mean gini
        let at_mean = model.predict_upper(0.35) - model.predict(0.35);
        let far = model.predict_upper(0.9) - model.predict(0.9);
        assert!(far > at_mean);
    }

    #[test]
    fn test_edf_model_input_checks() {
        assert_eq!(EdfGiniModel::fit(&[(0.1, 1.0), (0.2, 2.0)]).unwrap_err(), GiniError::TooFewPoints(2));
        assert_eq!(
            EdfGiniModel::fit(&[(0.3, 1.0), (0.3, 2.0), (0.3, 4.0)]).unwrap_err(),
            GiniError::NoSpread
        );
    }
}
