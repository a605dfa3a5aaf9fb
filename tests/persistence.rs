mod common;

use common::*;
use flate2::read::GzDecoder;
use scmarginal::io::{load_fits, save_fits, write_fit_summary};
use scmarginal::{fit_marginals, FitOptions, FormulaSpec, ModelKind, Solvers};
use std::io::Read;

fn fitted() -> scmarginal::FeatureFits {
    let mut values = varied_counts(12, 3) + 1.0;
    values[[0, 2]] = FAIL_COUNT;
    let data = dataset(covariates(12, &["T", "B"]), values);
    let solvers = Solvers::new(&MeanAdditive, &MockDistributional(DistMode::Fail));
    fit_marginals(
        &data,
        &FormulaSpec::new("gene ~ s(pseudotime)", "1"),
        &"poisson".into(),
        &FitOptions { trace: true, ..FitOptions::default() },
        solvers,
    )
    .unwrap()
}

#[test]
fn test_fits_survive_save_and_load() {
    let fits = fitted();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fits.bin");

    save_fits(&path, &fits).unwrap();
    let loaded = load_fits(&path).unwrap();

    assert_eq!(loaded.len(), fits.len());
    for (a, b) in fits.iter().zip(loaded.iter()) {
        assert_eq!(a.feature, b.feature);
        assert_eq!(a.log, b.log);
        match (&a.fit, &b.fit) {
            (Some(x), Some(y)) => {
                assert_eq!(x.model, y.model);
                assert_eq!(x.mean, y.mean);
                assert_eq!(x.observations, y.observations);
            }
            (None, None) => {}
            _ => panic!("fit presence changed for {}", a.feature),
        }
    }
    assert!(!loaded.get("gene2").unwrap().is_fitted());
}

#[test]
fn test_summary_has_one_row_per_feature() {
    let fits = fitted();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.tsv.gz");

    write_fit_summary(&path, &fits).unwrap();

    let mut text = String::new();
    GzDecoder::new(std::fs::File::open(&path).unwrap()).read_to_string(&mut text).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "feature\tmodel\tedf\taic\tbasis_override\tremoved_cells\twarnings");
    assert_eq!(lines.len(), 1 + fits.len());
    assert!(lines[1].starts_with(&format!("gene0\t{}\t", ModelKind::Additive.label())));
    assert!(lines[3].starts_with("gene2\tnone\t"));
}
