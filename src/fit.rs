//! Module with the entry points: option handling, validation, the optional
//! accelerated two-pass fit and assembly of the ordered result collection.
use crate::accelerate::{self, AccelerationPlan};
use crate::data::{DataError, MarginalData};
use crate::dispatch::{Dispatcher, ParallelBackend, ParallelConfig};
use crate::family::{Family, FamilyAssignment, FamilyError};
use crate::fitter::{fit_feature, FeatureTask, FitContext};
use crate::formula::{FormulaError, FormulaSpec};
use crate::solver::Solvers;
use crate::{FeatureFits, FitResult};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Family error: {0}")]
    Family(#[from] FamilyError),
    #[error("Parallel config {config} is not compatible with backend {backend}")]
    IncompatibleParallelConfig { backend: String, config: String },
    #[error("Predictor name '{0}' collides with a covariate column")]
    PredictorCollision(String),
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Result assembly failed: {0}")]
    Assembly(String),
}

/// Settings of one fitting call.
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Name the feature's counts take in the formulas.
    pub predictor: String,
    pub workers: usize,
    /// Use the large-data smoother for formulas with a smooth term.
    pub use_large_data_backend: bool,
    /// Enable the EDF-Gini two-pass fit.
    pub accelerate: bool,
    pub backend: ParallelBackend,
    pub parallel_config: ParallelConfig,
    /// Keep diagnostic logs and timings on fitted results.
    pub trace: bool,
    /// Leave out the selection summary.
    pub simplify: bool,
    pub filter_cells: bool,
    /// A distributional fit is kept only if
    /// `additive AIC - distributional AIC >= aic_margin`.
    pub aic_margin: f64,
    pub group_column: String,
    pub batch_column: String,
    /// Seed for the gini-subset draw.
    pub seed: Option<u64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            predictor: "gene".to_string(),
            workers: 1,
            use_large_data_backend: false,
            accelerate: false,
            backend: ParallelBackend::default(),
            parallel_config: ParallelConfig::default(),
            trace: false,
            simplify: false,
            filter_cells: false,
            aic_margin: f64::NEG_INFINITY,
            group_column: "cell_type".to_string(),
            batch_column: "batch".to_string(),
            seed: None,
        }
    }
}

/// Fits a marginal model for every feature of `data`.
///
/// Returns one result per feature in count-matrix column order. Fails only
/// for call-level problems (bad family assignment, incompatible parallel
/// config, unparsable formulas); anything that goes wrong inside a single
/// feature is recorded on that feature's result.
pub fn fit_marginals(
    data: &MarginalData,
    formulas: &FormulaSpec,
    families: &FamilyAssignment,
    options: &FitOptions,
    solvers: Solvers<'_>,
) -> Result<FeatureFits, FitError> {
    let features = data.counts.features();
    let families = families.resolve(features.len())?;
    let dispatcher = Dispatcher::new(options.backend, &options.parallel_config, options.workers)?;
    check_predictor(data, options)?;
    let model_formulas = formulas.parse(&options.predictor)?;

    log::info!("Fitting {} features ({} pre-filtered)", features.len(), data.filtered.len());
    log::info!("Mean formula: {}", model_formulas.mean);
    log::info!("Dispersion formula: {}", model_formulas.dispersion);

    let ctx = FitContext { data, formulas: &model_formulas, options, solvers };

    let passes = if accelerate::is_active(options.accelerate, features.len(), model_formulas.mean.basis_dim()) {
        let plan = AccelerationPlan::draw(features.len(), options.seed);
        log::info!(
            "Accelerated fit: {} subset features, {} predicted-complexity features",
            plan.subset.len(),
            plan.rest.len()
        );

        let subset_tasks = tasks(features, &families, plan.subset.iter().map(|&j| (j, None)));
        let first = dispatcher.run(&ctx, &subset_tasks)?;

        let rest_tasks = match accelerate::train(&first, &data.counts) {
            Ok(model) => tasks(
                features,
                &families,
                plan.rest
                    .iter()
                    .map(|&j| (j, Some(accelerate::predicted_basis_dim(&model, &data.counts, j)))),
            ),
            Err(e) => {
                log::warn!("EDF ~ Gini model could not be fitted ({}); using the requested basis dimension", e);
                tasks(features, &families, plan.rest.iter().map(|&j| (j, None)))
            }
        };
        let second = dispatcher.run(&ctx, &rest_tasks)?;
        vec![first, second]
    } else {
        let all = tasks(features, &families, (0..features.len()).map(|j| (j, None)));
        vec![dispatcher.run(&ctx, &all)?]
    };

    let fits = assemble(features, passes)?;
    let fitted = fits.iter().filter(|r| r.is_fitted()).count();
    log::info!("Fitted {} of {} features", fitted, fits.len());
    Ok(fits)
}

/// Fits a single feature in the calling thread, outside any pool.
///
/// Panics from the solvers are not caught here.
pub fn fit_single_feature(
    data: &MarginalData,
    formulas: &FormulaSpec,
    family: &str,
    feature: &str,
    options: &FitOptions,
    solvers: Solvers<'_>,
) -> Result<FitResult, FitError> {
    let family: Family = family.parse()?;
    let index = data
        .counts
        .feature_index(feature)
        .ok_or_else(|| FitError::UnknownFeature(feature.to_string()))?;
    check_predictor(data, options)?;
    let model_formulas = formulas.parse(&options.predictor)?;

    let ctx = FitContext { data, formulas: &model_formulas, options, solvers };
    let task = FeatureTask { feature, index, family, basis_override: None };
    Ok(fit_feature(&ctx, &task))
}

fn check_predictor(data: &MarginalData, options: &FitOptions) -> Result<(), FitError> {
    if data.covariates.has_column(&options.predictor) {
        return Err(FitError::PredictorCollision(options.predictor.clone()));
    }
    Ok(())
}

fn tasks<'a>(
    features: &'a [String],
    families: &[Family],
    items: impl Iterator<Item = (usize, Option<usize>)>,
) -> Vec<FeatureTask<'a>> {
    items
        .map(|(j, basis_override)| FeatureTask {
            feature: features[j].as_str(),
            index: j,
            family: families[j],
            basis_override,
        })
        .collect()
}

/// Merges the per-pass results, keyed by feature, back into `features` order.
pub fn assemble(features: &[String], passes: Vec<Vec<FitResult>>) -> Result<FeatureFits, FitError> {
    let mut by_feature: HashMap<String, FitResult> = HashMap::with_capacity(features.len());
    for result in passes.into_iter().flatten() {
        let feature = result.feature.clone();
        if by_feature.insert(feature.clone(), result).is_some() {
            return Err(FitError::Assembly(format!("feature '{}' was fitted more than once", feature)));
        }
    }
    if by_feature.len() != features.len() {
        return Err(FitError::Assembly(format!(
            "{} results for {} features",
            by_feature.len(),
            features.len()
        )));
    }
    let ordered = features
        .iter()
        .map(|f| {
            by_feature
                .remove(f)
                .ok_or_else(|| FitError::Assembly(format!("no result for feature '{}'", f)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FeatureFits::new(ordered))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped(feature: &str) -> FitResult {
        FitResult {
            feature: feature.to_string(),
            fit: None,
            log: None,
            timing: None,
            removed_cells: None,
            basis_override: None,
        }
    }

    #[test]
    fn test_assemble_restores_feature_order() {
        let features: Vec<String> = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let passes = vec![vec![skipped("c"), skipped("a")], vec![skipped("d"), skipped("b")]];
        let fits = assemble(&features, passes).unwrap();
        let order: Vec<&str> = fits.iter().map(|r| r.feature.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_assemble_rejects_overlap_and_gaps() {
        let features: Vec<String> = vec!["a".into(), "b".into()];
        assert!(matches!(
            assemble(&features, vec![vec![skipped("a")], vec![skipped("a")]]),
            Err(FitError::Assembly(_))
        ));
        assert!(matches!(assemble(&features, vec![vec![skipped("a")]]), Err(FitError::Assembly(_))));
    }

    #[test]
    fn test_default_options() {
        let options = FitOptions::default();
        assert_eq!(options.predictor, "gene");
        assert_eq!(options.workers, 1);
        assert!(!options.accelerate && !options.trace && !options.filter_cells);
        assert_eq!(options.parallel_config.backend(), options.backend);
        assert_eq!(options.aic_margin, f64::NEG_INFINITY);
    }
}
