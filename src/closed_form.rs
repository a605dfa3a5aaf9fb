//! Module for the fast path: intercept-only negative-binomial fits per
//! category (or category x batch) split.
use crate::data::CovariateTable;
use crate::{Diagnostic, Stage};
use ndarray::{Array1, ArrayView1};
use statrs::function::gamma::ln_gamma;
use std::collections::HashMap;

use argmin::core::{CostFunction, Error, Executor};
use argmin::solver::brent::BrentOpt;

use thiserror::Error;

/// Search interval for log(theta).
const LOG_THETA_MIN: f64 = -9.21; // ~1e-4
const LOG_THETA_MAX: f64 = 13.82; // ~1e6
const BRENT_TOL: f64 = 1e-8;
const BRENT_MAX_ITER: u64 = 200;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Degenerate data: {0}")]
    Degenerate(String),
    #[error("Optimization failed to converge: {0}")]
    Convergence(String),
    #[error("Optimization setup error: {0}")]
    Setup(String),
}

/// Negative log profile likelihood of theta with the mean fixed at its MLE.
/// The parameter is log(theta) so the search is unconstrained in scale.
struct NbProfileCost {
    y: Array1<f64>,
    mu: f64,
}

impl CostFunction for NbProfileCost {
    type Param = f64;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        let theta = param.exp();
        let log_p = (theta / (theta + self.mu)).ln();
        let log_q = (self.mu / (theta + self.mu)).ln();
        let ln_gamma_theta = ln_gamma(theta);

        let log_l: f64 = self
            .y
            .iter()
            .map(|&y| {
                let count_term = if y > 0.0 { y * log_q } else { 0.0 };
                ln_gamma(y + theta) - ln_gamma_theta - ln_gamma(y + 1.0) + theta * log_p + count_term
            })
            .sum();

        if !log_l.is_finite() {
            return Ok(1e100);
        }
        Ok(-log_l)
    }
}

/// Intercept-only negative-binomial fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NbInterceptFit {
    pub mu: f64,
    pub theta: f64,
}

/// Fits `y ~ 1` with a log link. The intercept MLE is the sample mean, so
/// only theta needs a one-dimensional search.
pub fn fit_nb_intercept(y: ArrayView1<'_, f64>) -> Result<NbInterceptFit, ModelError> {
    if y.is_empty() {
        return Err(ModelError::Setup("no observations in split".into()));
    }
    let mu = y.mean().unwrap_or(0.0);
    if mu.is_nan() || mu <= 0.0 {
        return Err(ModelError::Degenerate("all counts are zero".into()));
    }

    let cost = NbProfileCost { y: y.to_owned(), mu };
    let solver = BrentOpt::new(LOG_THETA_MIN, LOG_THETA_MAX).set_tolerance(BRENT_TOL, BRENT_TOL);

    let res = Executor::new(cost, solver)
        .configure(|state| state.max_iters(BRENT_MAX_ITER))
        .run()
        .map_err(|e| ModelError::Convergence(e.to_string()))?;

    let log_theta = res
        .state
        .best_param
        .ok_or_else(|| ModelError::Convergence("optimization found no best parameter".into()))?;
    let theta = log_theta.exp();
    if !theta.is_finite() {
        return Err(ModelError::Convergence(format!("non-finite theta {}", theta)));
    }
    log::trace!("NB intercept fit: mu = {:.4}, theta = {:.4}", mu, theta);

    Ok(NbInterceptFit { mu, theta })
}

/// Per-observation fitted values from the split-wise fits.
#[derive(Debug, Clone)]
pub struct GroupedFit {
    pub mean: Array1<f64>,
    pub dispersion: Array1<f64>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Splits observations by the joint levels of `group_columns` and fits each
/// split independently. Fitted values are written back at each observation's
/// original position, so the output is aligned to the table's row order.
///
/// A split whose fit fails keeps its observed counts as the mean, with
/// dispersion 0, and records a warning.
pub fn fit_by_group(
    covariates: &CovariateTable,
    response: ArrayView1<'_, f64>,
    group_columns: &[&str],
) -> Result<GroupedFit, ModelError> {
    let n = covariates.n_rows();
    if response.len() != n {
        return Err(ModelError::Setup(format!(
            "response has {} values but table has {} rows",
            response.len(),
            n
        )));
    }

    let columns = group_columns
        .iter()
        .map(|name| {
            covariates
                .column(name)
                .filter(|c| c.is_categorical())
                .ok_or_else(|| ModelError::Setup(format!("'{}' is not a categorical covariate", name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // split key -> row indices, keys in order of first appearance
    let mut order: Vec<String> = Vec::new();
    let mut splits: HashMap<String, Vec<usize>> = HashMap::new();
    for row in 0..n {
        let key = columns
            .iter()
            .map(|c| c.label(row).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":");
        splits
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    let mut mean = Array1::zeros(n);
    let mut dispersion = Array1::zeros(n);
    let mut diagnostics = Vec::new();

    for key in &order {
        let rows = &splits[key];
        let y_split: Array1<f64> = rows.iter().map(|&r| response[r]).collect();
        match fit_nb_intercept(y_split.view()) {
            Ok(fit) => {
                for &r in rows {
                    mean[r] = fit.mu;
                    dispersion[r] = fit.theta;
                }
            }
            Err(e) => {
                diagnostics.push(Diagnostic::warning(
                    Stage::ClosedForm,
                    format!("Split '{}' fell back to observed values: {}", key, e),
                ));
                for &r in rows {
                    mean[r] = response[r];
                    dispersion[r] = 0.0;
                }
            }
        }
    }

    log::debug!("Closed-form fit over {} splits ({} fell back)", order.len(), diagnostics.len());
    Ok(GroupedFit { mean, dispersion, diagnostics })
}
