//! Module for loading the covariate table and count matrix from TSV files,
//! persisting fitted results, and writing a per-feature summary table.
use crate::data::{CountMatrix, Covariate, CovariateTable, DataError};
use crate::{FeatureFits, ModelKind};
use csv::WriterBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use polars::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Data alignment error: {0}")]
    Alignment(String),
    #[error("Invalid data: {0}")]
    Data(#[from] DataError),
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

fn read_tsv(path: &Path) -> Result<DataFrame, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_parse_options(CsvParseOptions::default().with_separator(b'\t'))
        .try_into_reader_with_file_path(Some(path.into()))?
        .finish()?;
    log::info!("Loaded {:?}: {} rows, {} columns", path, df.height(), df.width());
    Ok(df)
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>, IoError> {
    df.column(name)?
        .cast(&DataType::String)?
        .str()?
        .into_iter()
        .map(|opt_s| opt_s.map(String::from))
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| IoError::Alignment(format!("Column '{}' contains nulls", name)))
}

fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, IoError> {
    df.column(name)?
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| IoError::Alignment(format!("Column '{}' contains nulls", name)))
}

/// Loads a per-observation covariate table.
///
/// Every column other than `row_id_col` becomes a covariate: numeric columns
/// as numeric covariates, everything else as categorical.
pub fn load_covariate_table(path: &Path, row_id_col: &str) -> Result<CovariateTable, IoError> {
    let df = read_tsv(path)?;
    let row_ids = string_column(&df, row_id_col)?;
    let mut table = CovariateTable::new(row_ids);

    for series in df.get_columns() {
        let name = series.name();
        if name == row_id_col {
            continue;
        }
        let column = if series.dtype().is_numeric() {
            Covariate::numeric(numeric_column(&df, name)?)
        } else {
            Covariate::categorical(&string_column(&df, name)?)
        };
        log::debug!(
            "Covariate '{}': {}",
            name,
            if column.is_categorical() { "categorical" } else { "numeric" }
        );
        table.push_column(name, column)?;
    }
    Ok(table)
}

/// Loads an observation x feature count table and reorders its rows to
/// `row_ids`. Every id must be present; extra rows are dropped.
pub fn load_count_matrix(path: &Path, row_id_col: &str, row_ids: &[String]) -> Result<CountMatrix, IoError> {
    let df = read_tsv(path)?;
    let file_ids = string_column(&df, row_id_col)?;
    let position: HashMap<&str, usize> = file_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let missing: Vec<&String> = row_ids.iter().filter(|id| !position.contains_key(id.as_str())).collect();
    if !missing.is_empty() {
        return Err(IoError::Alignment(format!(
            "Count table is missing {} observations. First few: {:?}",
            missing.len(),
            missing.iter().take(5).collect::<Vec<_>>()
        )));
    }
    let order: Vec<usize> = row_ids.iter().map(|id| position[id.as_str()]).collect();

    let features: Vec<String> = df
        .get_column_names()
        .into_iter()
        .filter(|&n| n != row_id_col)
        .map(String::from)
        .collect();
    let mut values = Array2::zeros((row_ids.len(), features.len()));
    for (j, feature) in features.iter().enumerate() {
        let column = numeric_column(&df, feature)?;
        for (i, &row) in order.iter().enumerate() {
            values[[i, j]] = column[row];
        }
    }
    log::info!("Count matrix: {} observations x {} features", values.nrows(), values.ncols());

    Ok(CountMatrix::new(values, features)?)
}

/// Saves fitted results to a binary file.
pub fn save_fits(path: &Path, fits: &FeatureFits) -> Result<(), IoError> {
    log::info!("Saving {} feature fits to {:?}", fits.len(), path);
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, fits)?;
    Ok(())
}

/// Loads results written by [`save_fits`].
pub fn load_fits(path: &Path) -> Result<FeatureFits, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let reader = BufReader::new(File::open(path)?);
    let fits: FeatureFits = bincode::deserialize_from(reader)?;
    log::info!("Loaded {} feature fits from {:?}", fits.len(), path);
    Ok(fits)
}

#[derive(serde::Serialize)]
struct SummaryRow<'a> {
    feature: &'a str,
    model: &'a str,
    edf: Option<f64>,
    aic: Option<f64>,
    basis_override: Option<usize>,
    removed_cells: usize,
    warnings: usize,
}

/// Writes one gzip-compressed TSV row per feature.
pub fn write_fit_summary(path: &Path, fits: &FeatureFits) -> Result<(), IoError> {
    let out = GzEncoder::new(File::create(path)?, Compression::default());
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(out);

    for result in fits {
        let fit = result.fit.as_ref();
        let aic = fit.and_then(|f| {
            let summary = f.summary.as_ref()?;
            match f.model {
                ModelKind::Distributional => summary.distributional_aic,
                _ => summary.additive_aic,
            }
        });
        writer.serialize(SummaryRow {
            feature: &result.feature,
            model: fit.map_or("none", |f| f.model.label()),
            edf: result.edf(),
            aic,
            basis_override: result.basis_override,
            removed_cells: result.removed_cells.as_ref().map_or(0, Vec::len),
            warnings: result.warnings().count(),
        })?;
    }
    let out = writer.into_inner().map_err(|e| IoError::Io(e.into_error()))?;
    out.finish()?;
    log::info!("Wrote fit summary for {} features to {:?}", fits.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_covariate_column_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "cov.tsv",
            "cell\tcell_type\tpseudotime\nc1\tA\t0.5\nc2\tB\t1.5\nc3\tA\t2.0\n",
        );
        let table = load_covariate_table(&path, "cell").unwrap();
        assert_eq!(table.row_ids(), &["c1", "c2", "c3"]);
        assert!(table.column("cell_type").unwrap().is_categorical());
        assert_eq!(table.column("pseudotime"), Some(&Covariate::numeric(vec![0.5, 1.5, 2.0])));
    }

    #[test]
    fn test_counts_are_aligned_to_row_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "counts.tsv", "cell\tg1\tg2\nc2\t5\t0\nc1\t1\t2\nc9\t7\t7\n");
        let ids = vec!["c1".to_string(), "c2".to_string()];
        let counts = load_count_matrix(&path, "cell", &ids).unwrap();
        assert_eq!(counts.features(), &["g1", "g2"]);
        assert_eq!(counts.feature(0).to_vec(), vec![1.0, 5.0]);
        assert_eq!(counts.feature(1).to_vec(), vec![2.0, 0.0]);

        let missing = vec!["c1".to_string(), "c3".to_string()];
        assert!(matches!(load_count_matrix(&path, "cell", &missing), Err(IoError::Alignment(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = load_fits(Path::new("/nonexistent/fits.bin")).unwrap_err();
        assert!(matches!(err, IoError::NotFound(_)));
    }
}
