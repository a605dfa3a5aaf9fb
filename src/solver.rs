//! Seams to the external regression engines.
//!
//! The smooth additive model and the distributional (location-scale-shape)
//! model are fitted by numerical libraries outside this crate. The fitter only
//! needs what the two traits below return: observation-aligned fitted means,
//! dispersion, and the summaries used by model selection.
//!
//! Dispersion is reported in the family's own parameterization: the size
//! parameter `theta` for negative-binomial families (`var = mu + mu^2 / theta`),
//! the standard deviation for Gaussian, and any fixed value for families
//! without a free dispersion parameter.

use crate::data::CovariateTable;
use crate::family::{AdditiveFamily, DistributionalFamily};
use crate::formula::{Formula, SmootherKind};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SolverError {
    #[error("Model fit failed: {0}")]
    Failed(String),
    #[error("Model fit did not converge: {0}")]
    Convergence(String),
}

/// Data a backend fits against: the working covariate table plus the
/// feature's counts, which formulas refer to by `predictor`.
#[derive(Debug, Clone, Copy)]
pub struct ModelFrame<'a> {
    pub covariates: &'a CovariateTable,
    pub response: ArrayView1<'a, f64>,
    pub predictor: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct AdditiveRequest<'a> {
    pub frame: ModelFrame<'a>,
    pub formula: &'a Formula,
    pub family: AdditiveFamily,
    pub kind: SmootherKind,
}

#[derive(Debug, Clone)]
pub struct AdditiveFit {
    pub mean: Array1<f64>,
    /// Single dispersion value shared by all observations.
    pub dispersion: f64,
    /// Total effective degrees of freedom.
    pub edf: f64,
    pub aic: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DistributionalRequest<'a> {
    pub frame: ModelFrame<'a>,
    pub mean: &'a Formula,
    pub dispersion: &'a Formula,
    pub family: DistributionalFamily,
    pub kind: SmootherKind,
}

#[derive(Debug, Clone)]
pub struct DistributionalFit {
    pub mean: Array1<f64>,
    pub dispersion: Array1<f64>,
    pub aic: f64,
}

pub trait AdditiveSolver: Send + Sync {
    fn fit(&self, request: &AdditiveRequest<'_>) -> Result<AdditiveFit, SolverError>;
}

pub trait DistributionalSolver: Send + Sync {
    fn fit(&self, request: &DistributionalRequest<'_>) -> Result<DistributionalFit, SolverError>;
}

/// The pair of backends used for one fitting call.
#[derive(Clone, Copy)]
pub struct Solvers<'a> {
    pub additive: &'a dyn AdditiveSolver,
    pub distributional: &'a dyn DistributionalSolver,
}

impl<'a> Solvers<'a> {
    pub fn new(additive: &'a dyn AdditiveSolver, distributional: &'a dyn DistributionalSolver) -> Self {
        Self { additive, distributional }
    }
}
