//! # SCMARGINAL-RUST Crate
//!
//! Fits, independently for every feature (gene) of a single-cell count
//! dataset, a marginal regression model of how the feature's mean and
//! dispersion vary with per-cell covariates. The fitted per-feature models are
//! what a downstream synthetic-data generator samples from.
//!
//! The regression engines themselves (smooth additive model, distributional
//! location-scale-shape model) are supplied by the caller through the traits in
//! [`solver`]. This crate decides which engine to run, with which formula,
//! whether to trust the result, and runs that decision across features in
//! parallel. See [`fit::fit_marginals`] for the entry point.

pub mod accelerate;
pub mod cell_filter;
pub mod closed_form;
pub mod data;
pub mod dispatch;
pub mod family;
pub mod fit;
pub mod fitter;
pub mod formula;
pub mod gini;
pub mod io;
pub mod solver;

use ndarray::Array1;
use std::sync::Arc;

pub use data::{CountMatrix, Covariate, CovariateTable, FilteredFeatureSet, MarginalData};
pub use dispatch::{ParallelBackend, ParallelConfig};
pub use family::{Family, FamilyAssignment};
pub use fit::{fit_marginals, fit_single_feature, FitError, FitOptions};
pub use formula::FormulaSpec;
pub use solver::{AdditiveSolver, DistributionalSolver, Solvers};

/// Step of the per-feature fit a diagnostic came from.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Filter,
    CellFilter,
    ClosedForm,
    Additive,
    Distributional,
    Selection,
    Worker,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One entry of a feature's diagnostic log.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(stage: Stage, message: impl Into<String>) -> Self {
        Self { stage, severity: Severity::Warning, message: message.into() }
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self { stage, severity: Severity::Error, message: message.into() }
    }
}

/// Wall-clock seconds spent in each backend; `None` when it was not run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct FitTiming {
    pub additive_secs: Option<f64>,
    pub distributional_secs: Option<f64>,
}

/// Which model produced the returned vectors.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Split-wise intercept-only negative binomial (fast path).
    ClosedForm,
    Additive,
    Distributional,
}

impl ModelKind {
    pub fn label(self) -> &'static str {
        match self {
            ModelKind::ClosedForm => "closed_form",
            ModelKind::Additive => "additive",
            ModelKind::Distributional => "distributional",
        }
    }
}

/// Selection details kept unless the caller asked for simplified output.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub additive_aic: Option<f64>,
    pub distributional_aic: Option<f64>,
    /// Formula text as handed to the selected backend.
    pub mean_formula: String,
    pub dispersion_formula: String,
}

/// Fitted marginal for one feature, aligned to `observations`.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct MarginalFit {
    pub model: ModelKind,
    /// Observation ids, in covariate-table row order, minus any removed cells.
    pub observations: Arc<[String]>,
    pub mean: Array1<f64>,
    pub dispersion: Array1<f64>,
    pub zero_prob: Array1<f64>,
    /// Effective degrees of freedom of the smooth additive fit, when one was run.
    pub edf: Option<f64>,
    pub summary: Option<ModelSummary>,
}

/// Outcome of fitting one feature. `fit` is `None` for skipped features and
/// for features where no backend produced a usable fit.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct FitResult {
    pub feature: String,
    pub fit: Option<MarginalFit>,
    pub log: Option<Vec<Diagnostic>>,
    pub timing: Option<FitTiming>,
    pub removed_cells: Option<Vec<String>>,
    /// Basis dimension forced onto the mean smoother by the accelerator.
    pub basis_override: Option<usize>,
}

impl FitResult {
    pub fn is_fitted(&self) -> bool {
        self.fit.is_some()
    }

    pub fn edf(&self) -> Option<f64> {
        self.fit.as_ref().and_then(|f| f.edf)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.log.iter().flatten().filter(|d| d.severity == Severity::Warning)
    }
}

/// Results for every feature, in input feature order.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default)]
pub struct FeatureFits {
    results: Vec<FitResult>,
}

impl FeatureFits {
    pub fn new(results: Vec<FitResult>) -> Self {
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, feature: &str) -> Option<&FitResult> {
        self.results.iter().find(|r| r.feature == feature)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FitResult> {
        self.results.iter()
    }

    pub fn into_inner(self) -> Vec<FitResult> {
        self.results
    }
}

impl<'a> IntoIterator for &'a FeatureFits {
    type Item = &'a FitResult;
    type IntoIter = std::slice::Iter<'a, FitResult>;
    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
