//! Module holding the shared, read-only inputs of a fitting call: the
//! per-observation covariate table, the observation x feature count matrix
//! and the set of features excluded up front.
use ndarray::{Array2, ArrayView1};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Features with at most this many non-zero observations are skipped.
pub const MAX_NONZERO_FOR_SKIP: usize = 2;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Invalid dimensions: {0}")]
    Dimensions(String),
    #[error("Duplicate covariate column '{0}'")]
    DuplicateColumn(String),
    #[error("Invalid count value {value} for feature '{feature}' (counts must be finite and non-negative)")]
    InvalidCount { feature: String, value: f64 },
}

/// A single covariate column.
#[derive(Debug, Clone, PartialEq)]
pub enum Covariate {
    /// Factor column: `codes[i]` indexes into `levels`.
    Categorical { levels: Vec<String>, codes: Vec<usize> },
    Numeric(Vec<f64>),
}

impl Covariate {
    /// Builds a categorical column; levels are kept in order of first appearance.
    pub fn categorical<S: AsRef<str>>(values: &[S]) -> Self {
        let mut levels: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let codes = values
            .iter()
            .map(|v| {
                let v = v.as_ref();
                match index.get(v) {
                    Some(&code) => code,
                    None => {
                        let code = levels.len();
                        levels.push(v.to_string());
                        index.insert(v.to_string(), code);
                        code
                    }
                }
            })
            .collect();
        Covariate::Categorical { levels, codes }
    }

    pub fn numeric(values: Vec<f64>) -> Self {
        Covariate::Numeric(values)
    }

    pub fn len(&self) -> usize {
        match self {
            Covariate::Categorical { codes, .. } => codes.len(),
            Covariate::Numeric(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, Covariate::Categorical { .. })
    }

    /// Level label of row `i` for categorical columns.
    pub fn label(&self, i: usize) -> Option<&str> {
        match self {
            Covariate::Categorical { levels, codes } => Some(levels[codes[i]].as_str()),
            Covariate::Numeric(_) => None,
        }
    }

    /// Subsets rows; categorical levels that no longer occur are dropped.
    fn select(&self, rows: &[usize]) -> Covariate {
        match self {
            Covariate::Categorical { levels, codes } => {
                let labels: Vec<&str> = rows.iter().map(|&r| levels[codes[r]].as_str()).collect();
                Covariate::categorical(&labels)
            }
            Covariate::Numeric(values) => Covariate::Numeric(rows.iter().map(|&r| values[r]).collect()),
        }
    }
}

/// One row per observation, named covariate columns.
#[derive(Debug, Clone)]
pub struct CovariateTable {
    row_ids: Arc<[String]>,
    columns: Vec<(String, Covariate)>,
}

impl CovariateTable {
    pub fn new(row_ids: Vec<String>) -> Self {
        Self { row_ids: row_ids.into(), columns: Vec::new() }
    }

    pub fn with_column(mut self, name: &str, column: Covariate) -> Result<Self, DataError> {
        self.push_column(name, column)?;
        Ok(self)
    }

    pub fn push_column(&mut self, name: &str, column: Covariate) -> Result<(), DataError> {
        if self.has_column(name) {
            return Err(DataError::DuplicateColumn(name.to_string()));
        }
        if column.len() != self.row_ids.len() {
            return Err(DataError::Dimensions(format!(
                "Covariate '{}' has {} values but the table has {} rows",
                name,
                column.len(),
                self.row_ids.len()
            )));
        }
        self.columns.push((name.to_string(), column));
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.row_ids.len()
    }

    pub fn row_ids(&self) -> &[String] {
        &self.row_ids
    }

    /// Row ids as a shared handle, so unfiltered fits do not copy them.
    pub fn shared_row_ids(&self) -> Arc<[String]> {
        Arc::clone(&self.row_ids)
    }

    pub fn column(&self, name: &str) -> Option<&Covariate> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// New table restricted to `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> CovariateTable {
        let row_ids: Vec<String> = rows.iter().map(|&r| self.row_ids[r].clone()).collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, col)| (name.clone(), col.select(rows)))
            .collect();
        CovariateTable { row_ids: row_ids.into(), columns }
    }
}

/// Observation x feature counts.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    features: Vec<String>,
    index: HashMap<String, usize>,
    values: Array2<f64>,
}

impl CountMatrix {
    pub fn new(values: Array2<f64>, features: Vec<String>) -> Result<Self, DataError> {
        if values.ncols() != features.len() {
            return Err(DataError::Dimensions(format!(
                "Count matrix has {} columns but {} feature names",
                values.ncols(),
                features.len()
            )));
        }
        for (j, feature) in features.iter().enumerate() {
            if let Some(&bad) = values.column(j).iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(DataError::InvalidCount { feature: feature.clone(), value: bad });
            }
        }
        let index: HashMap<String, usize> =
            features.iter().enumerate().map(|(j, f)| (f.clone(), j)).collect();
        if index.len() != features.len() {
            return Err(DataError::Dimensions("Feature names are not unique".into()));
        }
        Ok(Self { features, index, values })
    }

    pub fn n_obs(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn feature_index(&self, feature: &str) -> Option<usize> {
        self.index.get(feature).copied()
    }

    /// Counts of feature `j` across all observations.
    pub fn feature(&self, j: usize) -> ArrayView1<'_, f64> {
        self.values.column(j)
    }
}

/// Features excluded from fitting.
#[derive(Debug, Clone, Default)]
pub struct FilteredFeatureSet(HashSet<String>);

impl FilteredFeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every feature with at most `max_nonzero` non-zero observations.
    pub fn from_counts(counts: &CountMatrix, max_nonzero: usize) -> Self {
        let set = counts
            .features()
            .iter()
            .enumerate()
            .filter(|(j, _)| counts.feature(*j).iter().filter(|&&v| v != 0.0).count() <= max_nonzero)
            .map(|(_, f)| f.clone())
            .collect();
        FilteredFeatureSet(set)
    }

    pub fn insert(&mut self, feature: &str) {
        self.0.insert(feature.to_string());
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.0.contains(feature)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for FilteredFeatureSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        FilteredFeatureSet(iter.into_iter().map(Into::into).collect())
    }
}

/// The covariates, counts and filtered set handed to `fit_marginals`.
#[derive(Debug, Clone)]
pub struct MarginalData {
    pub covariates: CovariateTable,
    pub counts: CountMatrix,
    pub filtered: FilteredFeatureSet,
}

impl MarginalData {
    pub fn new(
        covariates: CovariateTable,
        counts: CountMatrix,
        filtered: FilteredFeatureSet,
    ) -> Result<Self, DataError> {
        if covariates.n_rows() != counts.n_obs() {
            return Err(DataError::Dimensions(format!(
                "Covariate table has {} rows but count matrix has {} observations",
                covariates.n_rows(),
                counts.n_obs()
            )));
        }
        Ok(Self { covariates, counts, filtered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_categorical_levels_in_first_appearance_order() {
        let col = Covariate::categorical(&["b", "a", "b", "c"]);
        match &col {
            Covariate::Categorical { levels, codes } => {
                assert_eq!(levels, &vec!["b", "a", "c"]);
                assert_eq!(codes, &vec![0, 1, 0, 2]);
            }
            _ => panic!("expected categorical"),
        }
        assert_eq!(col.label(3), Some("c"));
    }

    #[test]
    fn test_select_rows_drops_unused_levels() {
        let table = CovariateTable::new(vec!["c1".into(), "c2".into(), "c3".into()])
            .with_column("cell_type", Covariate::categorical(&["A", "B", "A"]))
            .unwrap();
        let sub = table.select_rows(&[0, 2]);
        assert_eq!(sub.row_ids(), &["c1".to_string(), "c3".to_string()]);
        match sub.column("cell_type").unwrap() {
            Covariate::Categorical { levels, .. } => assert_eq!(levels, &vec!["A"]),
            _ => panic!("expected categorical"),
        }
    }

    #[test]
    fn test_column_length_mismatch_is_rejected() {
        let result = CovariateTable::new(vec!["c1".into()])
            .with_column("x", Covariate::numeric(vec![1.0, 2.0]));
        assert!(matches!(result, Err(DataError::Dimensions(_))));
    }

    #[test]
    fn test_negative_counts_are_rejected() {
        let result = CountMatrix::new(array![[1.0], [-1.0]], vec!["g1".into()]);
        assert!(matches!(result, Err(DataError::InvalidCount { .. })));
    }

    #[test]
    fn test_filtered_set_from_counts() {
        let counts = CountMatrix::new(
            array![[0.0, 1.0], [0.0, 2.0], [3.0, 4.0], [1.0, 0.0]],
            vec!["sparse".into(), "dense".into()],
        )
        .unwrap();
        let filtered = FilteredFeatureSet::from_counts(&counts, MAX_NONZERO_FOR_SKIP);
        assert!(filtered.contains("sparse"));
        assert!(!filtered.contains("dense"));
    }
}
