//! Module for fitting one feature: fast path, smooth additive fit,
//! distributional fit, and the choice between them.
use crate::cell_filter::filter_cells;
use crate::closed_form::fit_by_group;
use crate::data::{Covariate, CovariateTable, MarginalData};
use crate::family::Family;
use crate::fit::FitOptions;
use crate::formula::{ModelFormulas, SmootherKind};
use crate::solver::{
    AdditiveFit, AdditiveRequest, DistributionalFit, DistributionalRequest, ModelFrame, Solvers,
};
use crate::{Diagnostic, FitResult, FitTiming, MarginalFit, ModelKind, ModelSummary, Stage};
use ndarray::{Array1, ArrayView1};
use std::time::Instant;

/// Fitted mean may not exceed this multiple of the largest observed count.
pub const MAX_MEAN_RATIO: f64 = 10.0;
/// Negative-binomial theta above this is treated as a runaway fit.
pub const MAX_NB_THETA: f64 = 1000.0;

/// Shared, read-only state of one fitting call.
#[derive(Clone, Copy)]
pub struct FitContext<'a> {
    pub data: &'a MarginalData,
    pub formulas: &'a ModelFormulas,
    pub options: &'a FitOptions,
    pub solvers: Solvers<'a>,
}

/// What varies between features.
#[derive(Debug, Clone, Copy)]
pub struct FeatureTask<'a> {
    pub feature: &'a str,
    /// Column of the feature in the count matrix.
    pub index: usize,
    pub family: Family,
    /// Basis dimension for the mean formula's first smoother.
    pub basis_override: Option<usize>,
}

/// Per-feature diagnostic accumulator. Owned by a single fit and returned
/// with its result; every entry is mirrored to the `log` facade.
struct FitLog<'a> {
    feature: &'a str,
    entries: Vec<Diagnostic>,
}

impl<'a> FitLog<'a> {
    fn new(feature: &'a str) -> Self {
        Self { feature, entries: Vec::new() }
    }

    fn push(&mut self, diagnostic: Diagnostic) {
        log::warn!("[{}] {:?}: {}", self.feature, diagnostic.stage, diagnostic.message);
        self.entries.push(diagnostic);
    }
}

/// Working inputs after cell filtering.
struct WorkingFrame<'a> {
    covariates: std::borrow::Cow<'a, CovariateTable>,
    response: std::borrow::Cow<'a, Array1<f64>>,
    formulas: ModelFormulas,
    removed_cells: Option<Vec<String>>,
}

impl WorkingFrame<'_> {
    fn frame<'b>(&'b self, predictor: &'b str) -> ModelFrame<'b> {
        ModelFrame { covariates: &self.covariates, response: self.response.view(), predictor }
    }
}

/// Fits one feature. Never fails: every problem is recorded on the result.
pub fn fit_feature(ctx: &FitContext<'_>, task: &FeatureTask<'_>) -> FitResult {
    let options = ctx.options;
    let mut log = FitLog::new(task.feature);

    if ctx.data.filtered.contains(task.feature) {
        log.push(Diagnostic::warning(
            Stage::Filter,
            "Feature has too few non-zero observations; skipped",
        ));
        return package(task, None, log, FitTiming::default(), None, options);
    }

    let counts = ctx.data.counts.feature(task.index).to_owned();
    let formulas = ctx.formulas.with_basis_dim(task.basis_override);
    let working = prepare_frame(ctx, counts, formulas, &mut log);

    let mut timing = FitTiming::default();
    let fit = match fast_path_columns(&working, options) {
        Some(columns) => fit_closed_form(ctx, &working, &columns, &mut log),
        None => fit_general(ctx, task, &working, &mut timing, &mut log),
    };

    let removed = working.removed_cells;
    package(task, fit, log, timing, removed, options)
}

fn prepare_frame<'a>(
    ctx: &FitContext<'a>,
    counts: Array1<f64>,
    formulas: ModelFormulas,
    log: &mut FitLog<'_>,
) -> WorkingFrame<'a> {
    use std::borrow::Cow;

    let covariates = &ctx.data.covariates;
    let predictor = ctx.options.predictor.as_str();
    let filtered = if ctx.options.filter_cells {
        filter_cells(covariates, counts.view(), &formulas, predictor)
    } else {
        None
    };

    match filtered {
        None => WorkingFrame {
            covariates: Cow::Borrowed(covariates),
            response: Cow::Owned(counts),
            formulas,
            removed_cells: None,
        },
        Some(outcome) => {
            for name in &outcome.dropped_covariates {
                log.push(Diagnostic::warning(
                    Stage::CellFilter,
                    format!("Covariate '{}' has a single non-zero level; removed from formulas", name),
                ));
            }
            if let Some(removed) = &outcome.removed_cells {
                log.push(Diagnostic::warning(
                    Stage::CellFilter,
                    format!("Removed {} cells in zero-count categories", removed.len()),
                ));
            }
            WorkingFrame {
                covariates: outcome.covariates.map_or(Cow::Borrowed(covariates), Cow::Owned),
                response: Cow::Owned(outcome.response.unwrap_or(counts)),
                formulas: outcome.formulas,
                removed_cells: outcome.removed_cells,
            }
        }
    }
}

/// Grouping columns when the mean formula is exactly `group` or
/// `group + batch` over categorical covariates.
fn fast_path_columns(working: &WorkingFrame<'_>, options: &FitOptions) -> Option<Vec<String>> {
    let names = working.formulas.mean.linear_names()?;
    let group = options.group_column.as_str();
    let batch = options.batch_column.as_str();
    let matches = names == [group] || names == [group, batch];
    let categorical = names
        .iter()
        .all(|n| working.covariates.column(n).is_some_and(Covariate::is_categorical));
    (matches && categorical).then(|| names.iter().map(|n| n.to_string()).collect())
}

fn fit_closed_form(
    ctx: &FitContext<'_>,
    working: &WorkingFrame<'_>,
    columns: &[String],
    log: &mut FitLog<'_>,
) -> Option<MarginalFit> {
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    log::debug!("[{}] closed-form fit by {:?}", log.feature, columns);

    match fit_by_group(&working.covariates, working.response.view(), &columns) {
        Ok(grouped) => {
            for d in grouped.diagnostics {
                log.push(d);
            }
            let n = grouped.mean.len();
            let summary = (!ctx.options.simplify).then(|| ModelSummary {
                additive_aic: None,
                distributional_aic: None,
                mean_formula: working.formulas.mean.render_additive(),
                dispersion_formula: working.formulas.dispersion.render_additive(),
            });
            Some(MarginalFit {
                model: ModelKind::ClosedForm,
                observations: working.covariates.shared_row_ids(),
                mean: grouped.mean,
                dispersion: grouped.dispersion,
                zero_prob: Array1::zeros(n),
                edf: None,
                summary,
            })
        }
        Err(e) => {
            log.push(Diagnostic::error(Stage::ClosedForm, e.to_string()));
            None
        }
    }
}

fn fit_general(
    ctx: &FitContext<'_>,
    task: &FeatureTask<'_>,
    working: &WorkingFrame<'_>,
    timing: &mut FitTiming,
    log: &mut FitLog<'_>,
) -> Option<MarginalFit> {
    let options = ctx.options;
    let formulas = &working.formulas;
    let kind = formulas.smoother_kind(options.use_large_data_backend);
    let frame = working.frame(&options.predictor);
    let n = frame.response.len();

    let started = Instant::now();
    let additive = ctx
        .solvers
        .additive
        .fit(&AdditiveRequest {
            frame,
            formula: &formulas.mean,
            family: task.family.additive(),
            kind,
        })
        .map_err(|e| e.to_string())
        .and_then(|fit| check_length(fit.mean.len(), n).map(|_| fit));
    timing.additive_secs = Some(started.elapsed().as_secs_f64());
    let additive = match additive {
        Ok(fit) => Some(fit),
        Err(e) => {
            log.push(Diagnostic::error(Stage::Additive, e));
            None
        }
    };

    let needs_distributional =
        task.family.is_zero_inflated() || !formulas.dispersion.is_intercept_only();
    let distributional = if needs_distributional {
        let started = Instant::now();
        let result = ctx
            .solvers
            .distributional
            .fit(&DistributionalRequest {
                frame,
                mean: &formulas.mean,
                dispersion: &formulas.dispersion,
                family: task.family.distributional(),
                kind,
            })
            .map_err(|e| e.to_string())
            .and_then(|fit| {
                check_length(fit.mean.len(), n)?;
                check_length(fit.dispersion.len(), n).map(|_| fit)
            });
        timing.distributional_secs = Some(started.elapsed().as_secs_f64());
        match result {
            Ok(fit) => Some(fit),
            Err(e) => {
                log.push(Diagnostic::error(Stage::Distributional, e));
                None
            }
        }
    } else {
        None
    };

    let choice = select_model(
        additive.as_ref(),
        distributional.as_ref(),
        task.family,
        frame.response,
        options.aic_margin,
        log,
    )?;

    let summary = (!options.simplify).then(|| ModelSummary {
        additive_aic: additive.as_ref().map(|f| f.aic),
        distributional_aic: distributional.as_ref().map(|f| f.aic),
        mean_formula: render(choice, formulas, kind, true),
        dispersion_formula: render(choice, formulas, kind, false),
    });
    let edf = additive.as_ref().map(|f| f.edf);

    let (mean, dispersion) = match choice {
        ModelKind::Distributional => {
            let fit = distributional?;
            (fit.mean, fit.dispersion)
        }
        _ => {
            let fit = additive?;
            let dispersion = Array1::from_elem(n, fit.dispersion);
            (fit.mean, dispersion)
        }
    };

    Some(MarginalFit {
        model: choice,
        observations: working.covariates.shared_row_ids(),
        mean,
        dispersion,
        zero_prob: Array1::zeros(n),
        edf,
        summary,
    })
}

fn check_length(found: usize, expected: usize) -> Result<(), String> {
    if found == expected {
        Ok(())
    } else {
        Err(format!("solver returned {} fitted values for {} observations", found, expected))
    }
}

fn render(choice: ModelKind, formulas: &ModelFormulas, kind: SmootherKind, mean: bool) -> String {
    let formula = if mean { &formulas.mean } else { &formulas.dispersion };
    match choice {
        ModelKind::Distributional => formula.render_distributional(kind),
        _ => formula.render_additive(),
    }
}

/// Reasons to distrust an otherwise successful distributional fit.
pub fn distributional_problem(
    fit: &DistributionalFit,
    family: Family,
    response: ArrayView1<'_, f64>,
) -> Option<String> {
    if fit.mean.iter().chain(fit.dispersion.iter()).any(|v| !v.is_finite()) {
        return Some("non-finite fitted mean or dispersion".into());
    }
    let max_observed = response.iter().cloned().fold(0.0, f64::max);
    let max_mean = fit.mean.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_mean > MAX_MEAN_RATIO * max_observed {
        return Some(format!(
            "max fitted mean {:.3} exceeds {} x max observed count {}",
            max_mean, MAX_MEAN_RATIO, max_observed
        ));
    }
    if family.is_negative_binomial() {
        let max_theta = fit.dispersion.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max_theta > MAX_NB_THETA {
            return Some(format!("max fitted theta {:.3} exceeds {}", max_theta, MAX_NB_THETA));
        }
    }
    None
}

/// Chooses between the two fits.
///
/// The distributional fit is a candidate only when it succeeded; it is
/// rejected when [`distributional_problem`] finds anything, or when
/// `additive AIC - distributional AIC < aic_margin`. With the default margin
/// of negative infinity the AIC comparison never rejects.
pub fn select_model(
    additive: Option<&AdditiveFit>,
    distributional: Option<&DistributionalFit>,
    family: Family,
    response: ArrayView1<'_, f64>,
    aic_margin: f64,
    log: &mut impl DiagnosticSink,
) -> Option<ModelKind> {
    let smooth_only = additive.map(|_| ModelKind::Additive);

    let candidate = match distributional {
        Some(fit) => fit,
        None => {
            if smooth_only.is_none() {
                log.record(Diagnostic::error(Stage::Selection, "No model could be fitted"));
            }
            return smooth_only;
        }
    };

    if let Some(problem) = distributional_problem(candidate, family, response) {
        log.record(Diagnostic::warning(
            Stage::Selection,
            format!("Distributional fit rejected ({}); using smooth additive fit", problem),
        ));
        if smooth_only.is_none() {
            log.record(Diagnostic::error(Stage::Selection, "No usable model after rejection"));
        }
        return smooth_only;
    }

    match additive {
        Some(smooth) if smooth.aic - candidate.aic < aic_margin => Some(ModelKind::Additive),
        _ => Some(ModelKind::Distributional),
    }
}

/// Anything that collects diagnostics during selection.
pub trait DiagnosticSink {
    fn record(&mut self, diagnostic: Diagnostic);
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

impl DiagnosticSink for FitLog<'_> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

fn package(
    task: &FeatureTask<'_>,
    fit: Option<MarginalFit>,
    log: FitLog<'_>,
    timing: FitTiming,
    removed_cells: Option<Vec<String>>,
    options: &FitOptions,
) -> FitResult {
    // fit-absent results always carry the reason
    let keep_log = options.trace || fit.is_none();
    FitResult {
        feature: task.feature.to_string(),
        fit,
        log: keep_log.then_some(log.entries),
        timing: options.trace.then_some(timing),
        removed_cells,
        basis_override: task.basis_override,
    }
}
