//! Module for fanning per-feature fits out over a worker pool.
use crate::fit::FitError;
use crate::fitter::{fit_feature, FeatureTask, FitContext};
use crate::{Diagnostic, FitResult, Stage};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How features are spread over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelBackend {
    /// One task per feature on a shared pool.
    #[default]
    Pool,
    /// Features pre-partitioned into fixed-size chunks, one chunk per task.
    /// Used on platforms where the pool backends are unavailable.
    Chunked,
    /// Like `Pool`, logging progress as features complete.
    Progress,
}

impl ParallelBackend {
    /// Platform override: only unix targets run the pool backends.
    pub fn resolve(self) -> ParallelBackend {
        if cfg!(unix) || self == ParallelBackend::Chunked {
            self
        } else {
            log::warn!("{:?} backend is not available on this platform; using Chunked", self);
            ParallelBackend::Chunked
        }
    }
}

impl std::str::FromStr for ParallelBackend {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pool" => Ok(ParallelBackend::Pool),
            "chunked" => Ok(ParallelBackend::Chunked),
            "progress" => Ok(ParallelBackend::Progress),
            _ => Err("Unknown parallel backend. Use 'pool', 'chunked', or 'progress'."),
        }
    }
}

/// Backend-specific settings. Each variant only fits its own backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ParallelConfig {
    Pool { stack_size: Option<usize> },
    Chunked { chunk_size: usize },
    Progress { report_every: usize },
}

impl ParallelConfig {
    pub fn default_for(backend: ParallelBackend) -> Self {
        match backend {
            ParallelBackend::Pool => ParallelConfig::Pool { stack_size: None },
            ParallelBackend::Chunked => ParallelConfig::Chunked { chunk_size: 16 },
            ParallelBackend::Progress => ParallelConfig::Progress { report_every: 100 },
        }
    }

    pub fn backend(&self) -> ParallelBackend {
        match self {
            ParallelConfig::Pool { .. } => ParallelBackend::Pool,
            ParallelConfig::Chunked { .. } => ParallelBackend::Chunked,
            ParallelConfig::Progress { .. } => ParallelBackend::Progress,
        }
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig::default_for(ParallelBackend::default())
    }
}

/// Validated backend, config and worker cap for one call.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    backend: ParallelBackend,
    config: ParallelConfig,
    workers: usize,
}

impl Dispatcher {
    /// Checks `config` against the requested backend, then applies the
    /// platform override. An overridden backend gets its default config.
    pub fn new(backend: ParallelBackend, config: &ParallelConfig, workers: usize) -> Result<Self, FitError> {
        if config.backend() != backend {
            return Err(FitError::IncompatibleParallelConfig {
                backend: format!("{:?}", backend),
                config: format!("{:?}", config),
            });
        }
        if let ParallelConfig::Chunked { chunk_size: 0 } | ParallelConfig::Progress { report_every: 0 } = config {
            return Err(FitError::IncompatibleParallelConfig {
                backend: format!("{:?}", backend),
                config: format!("{:?} (must be > 0)", config),
            });
        }
        let resolved = backend.resolve();
        let config = if resolved == backend { config.clone() } else { ParallelConfig::default_for(resolved) };
        Ok(Self { backend: resolved, config, workers: workers.max(1) })
    }

    pub fn backend(&self) -> ParallelBackend {
        self.backend
    }

    /// Fits every task. Results come back one per task, each keyed by its
    /// feature id; callers must not rely on their order.
    pub fn run(&self, ctx: &FitContext<'_>, tasks: &[FeatureTask<'_>]) -> Result<Vec<FitResult>, FitError> {
        let threads = self.workers.min(tasks.len());
        if threads <= 1 {
            log::debug!("Fitting {} features serially", tasks.len());
            return Ok(tasks.iter().map(|task| fit_guarded(ctx, task)).collect());
        }

        let mut builder = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("marginal-fit-{}", i));
        if let ParallelConfig::Pool { stack_size: Some(size) } = self.config {
            builder = builder.stack_size(size);
        }
        let pool = builder.build()?;
        log::info!("Fitting {} features on {} workers ({:?})", tasks.len(), threads, self.backend);

        let results = match self.config {
            ParallelConfig::Pool { .. } => {
                pool.install(|| tasks.par_iter().map(|task| fit_guarded(ctx, task)).collect())
            }
            ParallelConfig::Chunked { chunk_size } => pool.install(|| {
                tasks
                    .par_chunks(chunk_size)
                    .flat_map_iter(|chunk| chunk.iter().map(|task| fit_guarded(ctx, task)))
                    .collect()
            }),
            ParallelConfig::Progress { report_every } => {
                let done = AtomicUsize::new(0);
                let total = tasks.len();
                pool.install(|| {
                    tasks
                        .par_iter()
                        .map(|task| {
                            let result = fit_guarded(ctx, task);
                            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                            if n % report_every == 0 || n == total {
                                log::info!("Fitted {}/{} features", n, total);
                            }
                            result
                        })
                        .collect()
                })
            }
        };
        Ok(results)
    }
}

/// Runs one fit, turning a panic inside a solver into a fit-absent result
/// for that feature only.
pub fn fit_guarded(ctx: &FitContext<'_>, task: &FeatureTask<'_>) -> FitResult {
    match catch_unwind(AssertUnwindSafe(|| fit_feature(ctx, task))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Fitting feature '{}' panicked: {}", task.feature, message);
            FitResult {
                feature: task.feature.to_string(),
                fit: None,
                log: Some(vec![Diagnostic::error(Stage::Worker, format!("fit panicked: {}", message))]),
                timing: None,
                removed_cells: None,
                basis_override: task.basis_override,
            }
        }
    }
}
