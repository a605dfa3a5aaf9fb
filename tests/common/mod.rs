#![allow(dead_code)]
//! Deterministic stand-ins for the external solvers and small datasets.
use ndarray::{Array1, Array2};
use scmarginal::solver::{
    AdditiveFit, AdditiveRequest, AdditiveSolver, DistributionalFit, DistributionalRequest,
    DistributionalSolver, SolverError,
};
use scmarginal::{CountMatrix, Covariate, CovariateTable, FilteredFeatureSet, MarginalData};

/// A count equal to this makes the mock solvers panic.
pub const PANIC_COUNT: f64 = 999.0;
/// A count equal to this makes the mock solvers return an error.
pub const FAIL_COUNT: f64 = 777.0;

/// Fits a constant mean. EDF grows with the share of zero counts, capped by
/// the requested basis dimension.
pub struct MeanAdditive;

impl AdditiveSolver for MeanAdditive {
    fn fit(&self, request: &AdditiveRequest<'_>) -> Result<AdditiveFit, SolverError> {
        let y = request.frame.response;
        if y.iter().any(|&v| v == PANIC_COUNT) {
            panic!("additive solver crashed");
        }
        if y.iter().any(|&v| v == FAIL_COUNT) {
            return Err(SolverError::Failed("singular design".into()));
        }
        let n = y.len();
        let mu = y.mean().unwrap_or(0.0);
        let zero_frac = y.iter().filter(|&&v| v == 0.0).count() as f64 / n as f64;
        let edf = match request.formula.basis_dim() {
            Some(k) => (3.0 + 20.0 * zero_frac).min(k as f64),
            None => 1.0,
        };
        Ok(AdditiveFit { mean: Array1::from_elem(n, mu), dispersion: 1.0, edf, aic: 100.0 })
    }
}

/// Always panics; used where no backend should be reached.
pub struct Unreachable;

impl AdditiveSolver for Unreachable {
    fn fit(&self, _: &AdditiveRequest<'_>) -> Result<AdditiveFit, SolverError> {
        panic!("additive backend should not be called")
    }
}

impl DistributionalSolver for Unreachable {
    fn fit(&self, _: &DistributionalRequest<'_>) -> Result<DistributionalFit, SolverError> {
        panic!("distributional backend should not be called")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistMode {
    /// Observed counts as the mean, dispersion 2.
    Clean,
    /// Means far above anything observed.
    Runaway,
    Fail,
}

pub struct MockDistributional(pub DistMode);

impl DistributionalSolver for MockDistributional {
    fn fit(&self, request: &DistributionalRequest<'_>) -> Result<DistributionalFit, SolverError> {
        let y = request.frame.response;
        let n = y.len();
        match self.0 {
            DistMode::Clean => Ok(DistributionalFit {
                mean: y.to_owned(),
                dispersion: Array1::from_elem(n, 2.0),
                aic: 500.0,
            }),
            DistMode::Runaway => {
                let max = y.iter().cloned().fold(0.0, f64::max);
                Ok(DistributionalFit {
                    mean: Array1::from_elem(n, 100.0 * (max + 1.0)),
                    dispersion: Array1::from_elem(n, 2.0),
                    aic: -1.0e6,
                })
            }
            DistMode::Fail => Err(SolverError::Convergence("iteration limit reached".into())),
        }
    }
}

pub fn cell_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("cell{}", i)).collect()
}

/// Table with `cell_type` (cycling through `types`), `batch` (b1/b2
/// alternating) and numeric `pseudotime`.
pub fn covariates(n: usize, types: &[&str]) -> CovariateTable {
    let cell_type: Vec<&str> = (0..n).map(|i| types[i % types.len()]).collect();
    let batch: Vec<&str> = (0..n).map(|i| if i % 2 == 0 { "b1" } else { "b2" }).collect();
    CovariateTable::new(cell_ids(n))
        .with_column("cell_type", Covariate::categorical(&cell_type))
        .unwrap()
        .with_column("batch", Covariate::categorical(&batch))
        .unwrap()
        .with_column("pseudotime", Covariate::numeric((0..n).map(|i| i as f64 / n as f64).collect()))
        .unwrap()
}

pub fn counts(values: Array2<f64>) -> CountMatrix {
    let names = (0..values.ncols()).map(|j| format!("gene{}", j)).collect();
    CountMatrix::new(values, names).unwrap()
}

pub fn dataset(table: CovariateTable, values: Array2<f64>) -> MarginalData {
    MarginalData::new(table, counts(values), FilteredFeatureSet::new()).unwrap()
}

/// Sparse counts whose zero share varies with the feature index.
pub fn varied_counts(n_obs: usize, n_features: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_obs, n_features), |(i, j)| {
        let period = 2 + j % 5;
        if i % period == 0 {
            (1 + (i + j) % 4) as f64
        } else {
            0.0
        }
    })
}
