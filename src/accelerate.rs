//! Module for the two-pass accelerated fit.
//!
//! A random subset of features is fitted at the requested smoother size.
//! Their realised EDF is regressed on the Gini coefficient of their log
//! counts, and the remaining features are then fitted with the smoother's
//! basis dimension set to the upper confidence bound of that regression.
use crate::data::CountMatrix;
use crate::gini::{log_count_gini, EdfGiniModel, GiniError};
use crate::FitResult;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Features fitted in the first pass.
pub const GINI_SUBSET_SIZE: usize = 100;
/// Acceleration needs strictly more features than this.
pub const MIN_FEATURES: usize = 100;
/// Acceleration needs a requested basis dimension of at least this.
pub const MIN_BASIS_DIM: usize = 200;

/// True when the accelerated two-pass fit should run.
pub fn is_active(enabled: bool, n_features: usize, basis_dim: Option<usize>) -> bool {
    enabled && n_features > MIN_FEATURES && basis_dim.is_some_and(|k| k >= MIN_BASIS_DIM)
}

/// Split of feature indices into the two passes. Both are sorted, disjoint
/// and together cover `0..n_features`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelerationPlan {
    pub subset: Vec<usize>,
    pub rest: Vec<usize>,
}

impl AccelerationPlan {
    /// Draws the gini-subset uniformly without replacement.
    pub fn draw(n_features: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let amount = GINI_SUBSET_SIZE.min(n_features);
        let mut subset = rand::seq::index::sample(&mut rng, n_features, amount).into_vec();
        subset.sort_unstable();

        let mut in_subset = vec![false; n_features];
        for &j in &subset {
            in_subset[j] = true;
        }
        let rest = (0..n_features).filter(|&j| !in_subset[j]).collect();
        Self { subset, rest }
    }
}

/// Fits the EDF ~ Gini relation on the fitted subset results.
///
/// Results without a fit or without an EDF (closed-form fits, skipped
/// features) do not contribute.
pub fn train(results: &[FitResult], counts: &CountMatrix) -> Result<EdfGiniModel, GiniError> {
    let points: Vec<(f64, f64)> = results
        .iter()
        .filter_map(|r| {
            let edf = r.edf()?;
            let j = counts.feature_index(&r.feature)?;
            Some((log_count_gini(counts.feature(j)), edf))
        })
        .collect();
    log::debug!("Training EDF ~ Gini model on {} of {} subset features", points.len(), results.len());
    EdfGiniModel::fit(&points)
}

/// Basis dimension for feature `j`: the rounded upper bound, at least 1.
pub fn predicted_basis_dim(model: &EdfGiniModel, counts: &CountMatrix, j: usize) -> usize {
    let upper = model.predict_upper(log_count_gini(counts.feature(j)));
    if upper.is_finite() {
        upper.round().max(1.0) as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FitResult, MarginalFit, ModelKind};
    use ndarray::{Array1, Array2};
    use std::sync::Arc;

    #[test]
    fn test_activation_thresholds() {
        assert!(is_active(true, 101, Some(200)));
        assert!(!is_active(true, 100, Some(250)));
        assert!(!is_active(true, 150, Some(199)));
        assert!(!is_active(true, 150, None));
        assert!(!is_active(false, 150, Some(250)));
    }

    #[test]
    fn test_plan_partitions_features() {
        let plan = AccelerationPlan::draw(150, Some(7));
        assert_eq!(plan.subset.len(), GINI_SUBSET_SIZE);
        assert_eq!(plan.rest.len(), 50);

        let mut all: Vec<usize> = plan.subset.iter().chain(plan.rest.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..150).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_plan_is_reproducible() {
        assert_eq!(AccelerationPlan::draw(300, Some(42)), AccelerationPlan::draw(300, Some(42)));
    }

    fn fitted(feature: &str, edf: Option<f64>) -> FitResult {
        FitResult {
            feature: feature.to_string(),
            fit: Some(MarginalFit {
                model: ModelKind::Additive,
                observations: Arc::from(vec!["c0".to_string()]),
                mean: Array1::zeros(1),
                dispersion: Array1::zeros(1),
                zero_prob: Array1::zeros(1),
                edf,
                summary: None,
            }),
            log: None,
            timing: None,
            removed_cells: None,
            basis_override: None,
        }
    }

    #[test]
    fn test_train_uses_only_results_with_edf() {
        // feature j has j + 1 non-zero cells out of 6
        let mut values = Array2::<f64>::zeros((6, 5));
        for j in 0..5 {
            for i in 0..=j {
                values[[i, j]] = 3.0;
            }
        }
        let names: Vec<String> = (0..5).map(|j| format!("f{}", j)).collect();
        let counts = CountMatrix::new(values, names).unwrap();

        let results = vec![
            fitted("f0", Some(20.0)),
            fitted("f1", Some(16.0)),
            fitted("f2", None),
            fitted("f3", Some(9.0)),
            fitted("f4", Some(5.0)),
        ];
        let model = train(&results, &counts).unwrap();
        // sparser features are more unequal and get larger EDF here
        assert!(model.slope > 0.0);
        assert!(predicted_basis_dim(&model, &counts, 0) >= predicted_basis_dim(&model, &counts, 4));

        assert_eq!(train(&results[..2], &counts).unwrap_err(), GiniError::TooFewPoints(2));
    }
}
