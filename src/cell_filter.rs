//! Module for dropping cells (or whole covariates) whose categories carry no
//! signal for a feature.
//!
//! Only applies when every covariate of the mean formula is categorical. For
//! each such covariate the feature's counts are summed per level. Levels with
//! a zero sum cannot be fitted with a log link: if they leave a single
//! non-zero level the covariate is dropped from the formulas, otherwise the
//! cells of those levels are removed.
use crate::data::{Covariate, CovariateTable};
use crate::formula::ModelFormulas;
use ndarray::{Array1, ArrayView1};
use std::collections::BTreeSet;

/// Result of a filtering pass that changed something.
#[derive(Debug, Clone)]
pub struct CellFilterOutcome {
    /// Reduced table; `None` when no cells were removed.
    pub covariates: Option<CovariateTable>,
    /// Reduced counts matching `covariates`.
    pub response: Option<Array1<f64>>,
    pub formulas: ModelFormulas,
    pub removed_cells: Option<Vec<String>>,
    pub dropped_covariates: Vec<String>,
}

/// True when the mean formula reads at least one covariate and all of them
/// are categorical columns of `covariates`.
pub fn is_applicable(covariates: &CovariateTable, formulas: &ModelFormulas, predictor: &str) -> bool {
    let names: Vec<String> = formulas.mean.covariates().into_iter().filter(|n| n != predictor).collect();
    !names.is_empty()
        && names
            .iter()
            .all(|n| covariates.column(n).is_some_and(Covariate::is_categorical))
}

/// Runs the filter. Returns `None` when it does not apply or no category of
/// any mean covariate sums to zero.
pub fn filter_cells(
    covariates: &CovariateTable,
    response: ArrayView1<'_, f64>,
    formulas: &ModelFormulas,
    predictor: &str,
) -> Option<CellFilterOutcome> {
    if !is_applicable(covariates, formulas, predictor) {
        return None;
    }

    let mut remove_rows: BTreeSet<usize> = BTreeSet::new();
    let mut dropped_covariates: Vec<String> = Vec::new();

    for name in formulas.mean.covariates().into_iter().filter(|n| n != predictor) {
        let (levels, codes) = match covariates.column(&name) {
            Some(Covariate::Categorical { levels, codes }) => (levels, codes),
            _ => continue,
        };

        let mut sums = vec![0.0; levels.len()];
        for (row, &code) in codes.iter().enumerate() {
            sums[code] += response[row];
        }
        let zero_levels: Vec<usize> = (0..levels.len()).filter(|&l| sums[l] == 0.0).collect();
        if zero_levels.is_empty() {
            continue;
        }

        if zero_levels.len() + 1 >= levels.len() {
            log::debug!(
                "Covariate '{}' has {} of {} levels with zero counts; dropping it from the formulas",
                name,
                zero_levels.len(),
                levels.len()
            );
            dropped_covariates.push(name);
        } else {
            log::debug!(
                "Covariate '{}': removing cells of zero-count levels {:?}",
                name,
                zero_levels.iter().map(|&l| levels[l].as_str()).collect::<Vec<_>>()
            );
            remove_rows.extend(
                codes
                    .iter()
                    .enumerate()
                    .filter(|&(_, &code)| zero_levels.contains(&code))
                    .map(|(row, _)| row),
            );
        }
    }

    if remove_rows.is_empty() && dropped_covariates.is_empty() {
        return None;
    }

    let reduced_formulas = dropped_covariates
        .iter()
        .fold(formulas.clone(), |f, name| f.without_covariate(name));

    let (reduced_table, reduced_response, removed_cells) = if remove_rows.is_empty() {
        (None, None, None)
    } else {
        let kept: Vec<usize> = (0..covariates.n_rows()).filter(|r| !remove_rows.contains(r)).collect();
        let removed: Vec<String> = remove_rows.iter().map(|&r| covariates.row_ids()[r].clone()).collect();
        let y: Array1<f64> = kept.iter().map(|&r| response[r]).collect();
        (Some(covariates.select_rows(&kept)), Some(y), Some(removed))
    };

    Some(CellFilterOutcome {
        covariates: reduced_table,
        response: reduced_response,
        formulas: reduced_formulas,
        removed_cells,
        dropped_covariates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::FormulaSpec;
    use ndarray::array;

    fn table() -> CovariateTable {
        CovariateTable::new((0..8).map(|i| format!("cell{}", i)).collect())
            .with_column("cell_type", Covariate::categorical(&["A", "A", "B", "B", "C", "C", "D", "D"]))
            .unwrap()
            .with_column("batch", Covariate::categorical(&["b1", "b2", "b1", "b2", "b1", "b2", "b1", "b2"]))
            .unwrap()
            .with_column("pseudotime", Covariate::numeric((0..8).map(f64::from).collect()))
            .unwrap()
    }

    #[test]
    fn test_not_applicable_with_numeric_covariate() {
        let formulas = FormulaSpec::new("cell_type + s(pseudotime)", "1").parse("gene").unwrap();
        let y = array![0.0, 0.0, 1.0, 2.0, 3.0, 1.0, 4.0, 2.0];
        assert!(!is_applicable(&table(), &formulas, "gene"));
        assert!(filter_cells(&table(), y.view(), &formulas, "gene").is_none());
    }

    #[test]
    fn test_no_zero_levels_is_a_no_op() {
        let formulas = FormulaSpec::new("cell_type", "1").parse("gene").unwrap();
        let y = array![1.0, 0.0, 1.0, 2.0, 3.0, 1.0, 4.0, 2.0];
        assert!(filter_cells(&table(), y.view(), &formulas, "gene").is_none());
    }

    #[test]
    fn test_zero_level_cells_are_removed() {
        let formulas = FormulaSpec::new("cell_type", "1").parse("gene").unwrap();
        let y = array![0.0, 0.0, 1.0, 2.0, 3.0, 1.0, 4.0, 2.0];
        let out = filter_cells(&table(), y.view(), &formulas, "gene").unwrap();

        assert_eq!(out.removed_cells, Some(vec!["cell0".to_string(), "cell1".to_string()]));
        let reduced = out.covariates.unwrap();
        assert_eq!(reduced.n_rows(), 6);
        assert_eq!(reduced.row_ids()[0], "cell2");
        assert_eq!(out.response.unwrap(), array![1.0, 2.0, 3.0, 1.0, 4.0, 2.0]);
        assert_eq!(out.formulas, formulas);
        assert!(out.dropped_covariates.is_empty());
    }

    #[test]
    fn test_covariate_dropped_when_one_level_remains() {
        let formulas = FormulaSpec::new("cell_type + batch", "batch").parse("gene").unwrap();
        // only batch b2 has counts
        let y = array![0.0, 1.0, 0.0, 2.0, 0.0, 1.0, 0.0, 5.0];
        let out = filter_cells(&table(), y.view(), &formulas, "gene").unwrap();

        assert_eq!(out.dropped_covariates, vec!["batch".to_string()]);
        assert!(out.removed_cells.is_none());
        assert!(out.covariates.is_none());
        assert_eq!(out.formulas.mean.linear_names(), Some(vec!["cell_type"]));
        assert!(out.formulas.dispersion.is_intercept_only());
    }
}
