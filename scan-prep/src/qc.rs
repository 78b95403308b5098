//! Per-barcode quality control metrics

use crate::stats::finite_median;
use log::warn;
use ndarray::Array1;
use rayon::prelude::*;
use scan_types::{CountMatrix, PrepError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default prefix of mitochondrial gene symbols (human)
pub const MITO_PREFIX_DEFAULT: &str = "MT-";

/// Named per-barcode QC metric
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcMetric {
    /// UMI count summed over all features
    TotalCount,
    /// number of features with a non-zero count
    FeatureCount,
    /// percentage of UMIs from mitochondrial features
    MitochondrialFraction,
}

impl fmt::Display for QcMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QcMetric::TotalCount => "total_count",
            QcMetric::FeatureCount => "feature_count",
            QcMetric::MitochondrialFraction => "mitochondrial_fraction",
        })
    }
}

/// QC metrics for every barcode of a matrix, in column order
#[derive(Clone, Debug, PartialEq)]
pub struct CellMetrics {
    pub total_count: Array1<u64>,
    pub feature_count: Array1<u32>,
    pub mitochondrial_fraction: Array1<f64>,
}

impl CellMetrics {
    pub fn len(&self) -> usize {
        self.total_count.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count.is_empty()
    }

    /// Value of `metric` for barcode `cell`, as f64 for threshold comparisons
    pub fn get(&self, metric: QcMetric, cell: usize) -> f64 {
        match metric {
            QcMetric::TotalCount => self.total_count[cell] as f64,
            QcMetric::FeatureCount => self.feature_count[cell] as f64,
            QcMetric::MitochondrialFraction => self.mitochondrial_fraction[cell],
        }
    }

    /// Metrics of the given barcodes, in the given order
    pub fn select(&self, cells: &[usize]) -> CellMetrics {
        CellMetrics {
            total_count: cells.iter().map(|&c| self.total_count[c]).collect(),
            feature_count: cells.iter().map(|&c| self.feature_count[c]).collect(),
            mitochondrial_fraction: cells.iter().map(|&c| self.mitochondrial_fraction[c]).collect(),
        }
    }

    pub fn summary(&self) -> QcSummary {
        let median = |xs: Array1<f64>| finite_median(xs.view()).unwrap_or(f64::NAN);
        QcSummary {
            num_cells: self.len(),
            median_total_count: median(self.total_count.mapv(|v| v as f64)),
            median_feature_count: median(self.feature_count.mapv(f64::from)),
            median_mitochondrial_fraction: median(self.mitochondrial_fraction.clone()),
        }
    }
}

/// Medians of the QC metrics, for logging and reports
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QcSummary {
    pub num_cells: usize,
    pub median_total_count: f64,
    pub median_feature_count: f64,
    pub median_mitochondrial_fraction: f64,
}

/// A count matrix together with the QC metrics of its barcodes
#[derive(Clone, Debug, PartialEq)]
pub struct QcDataset {
    pub matrix: CountMatrix,
    pub metrics: CellMetrics,
}

/// Mask of the features whose identifier starts with any of `prefixes` (case-sensitive)
pub fn feature_set_mask(features: &[String], prefixes: &[&str]) -> Vec<bool> {
    features
        .iter()
        .map(|f| prefixes.iter().any(|p| f.starts_with(p)))
        .collect()
}

/// Percentage of each barcode's UMIs coming from features matching `prefixes`.
/// Barcodes with no UMIs get NaN.
pub fn percent_feature_set(matrix: &CountMatrix, prefixes: &[&str]) -> Array1<f64> {
    let mask = feature_set_mask(matrix.features(), prefixes);
    let pct: Vec<f64> = (0..matrix.cols())
        .into_par_iter()
        .map(|c| {
            let col = matrix.column(c);
            let (total, in_set) = col.iter().fold((0u64, 0u64), |(t, s), (r, &v)| {
                let v = u64::from(v);
                (t + v, if mask[r] { s + v } else { s })
            });
            percent(in_set, total)
        })
        .collect();
    Array1::from(pct)
}

#[inline]
fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        f64::NAN
    } else {
        100.0 * part as f64 / total as f64
    }
}

/// Compute total count, detected feature count and mitochondrial percentage for every
/// barcode. Mitochondrial features are those whose identifier starts with `mito_prefix`.
pub fn compute_cell_metrics(matrix: &CountMatrix, mito_prefix: &str) -> Result<CellMetrics> {
    if mito_prefix.is_empty() {
        return Err(PrepError::Configuration("mitochondrial prefix must not be empty".into()));
    }
    let mito = feature_set_mask(matrix.features(), &[mito_prefix]);
    if !mito.iter().any(|&m| m) {
        warn!("no features start with '{}', mitochondrial fraction will be 0", mito_prefix);
    }

    let per_cell: Vec<(u64, u32, f64)> = (0..matrix.cols())
        .into_par_iter()
        .map(|c| {
            let col = matrix.column(c);
            let mut total = 0u64;
            let mut mito_total = 0u64;
            let mut detected = 0u32;
            for (r, &v) in col.iter() {
                let v = u64::from(v);
                total += v;
                if v > 0 {
                    detected += 1;
                }
                if mito[r] {
                    mito_total += v;
                }
            }
            (total, detected, percent(mito_total, total))
        })
        .collect();

    let empty = per_cell.iter().filter(|(total, _, _)| *total == 0).count();
    if empty > 0 {
        warn!("{} barcodes have no UMIs, their mitochondrial fraction is undefined", empty);
    }

    Ok(CellMetrics {
        total_count: per_cell.iter().map(|p| p.0).collect(),
        feature_count: per_cell.iter().map(|p| p.1).collect(),
        mitochondrial_fraction: per_cell.iter().map(|p| p.2).collect(),
    })
}

#[cfg(test)]
pub(crate) mod test_qc {
    use super::*;
    use ndarray::{array, Array2};

    pub(crate) fn example_matrix() -> CountMatrix {
        let dense = array![[10u32, 0, 5, 0], [0, 0, 0, 0], [1, 1, 1, 1]];
        let features = vec!["GENE_A".to_string(), "MT-B".to_string(), "GENE_C".to_string()];
        let barcodes = (1..=4).map(|i| format!("cell{i}")).collect();
        CountMatrix::from_dense("example", features, barcodes, dense.view()).unwrap()
    }

    #[test]
    fn test_hand_checked_metrics() {
        let metrics = compute_cell_metrics(&example_matrix(), MITO_PREFIX_DEFAULT).unwrap();
        assert_eq!(metrics.total_count, array![11u64, 1, 6, 1]);
        assert_eq!(metrics.feature_count, array![2u32, 1, 2, 1]);
        assert_eq!(metrics.mitochondrial_fraction, array![0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mito_fraction() {
        let dense = array![[30u32, 0], [10, 0], [60, 5]];
        let features = vec!["MT-CO1".to_string(), "mt-Nd1".to_string(), "ACTB".to_string()];
        let m = CountMatrix::from_dense("mito", features, vec!["a".into(), "b".into()], dense.view()).unwrap();

        // prefix match is case-sensitive
        let metrics = compute_cell_metrics(&m, "MT-").unwrap();
        assert_eq!(metrics.mitochondrial_fraction, array![30.0, 0.0]);

        let metrics = compute_cell_metrics(&m, "mt-").unwrap();
        assert_eq!(metrics.mitochondrial_fraction, array![10.0, 0.0]);

        let either = percent_feature_set(&m, &["MT-", "mt-"]);
        assert_eq!(either, array![40.0, 0.0]);
    }

    #[test]
    fn test_empty_barcode() {
        let dense = array![[0u32, 3], [0, 1]];
        let features = vec!["MT-A".to_string(), "B".to_string()];
        let m = CountMatrix::from_dense("empty", features, vec!["a".into(), "b".into()], dense.view()).unwrap();
        let metrics = compute_cell_metrics(&m, "MT-").unwrap();
        assert_eq!(metrics.total_count[0], 0);
        assert_eq!(metrics.feature_count[0], 0);
        assert!(metrics.mitochondrial_fraction[0].is_nan());
        assert_eq!(metrics.mitochondrial_fraction[1], 75.0);
    }

    #[test]
    fn test_empty_prefix() {
        let err = compute_cell_metrics(&example_matrix(), "").unwrap_err();
        assert!(matches!(err, PrepError::Configuration(_)));
    }

    #[test]
    fn test_feature_count_properties() {
        // pseudo-random sparse matrix with some empty columns
        let dense = Array2::from_shape_fn((7, 12), |(r, c)| {
            let v = (r * 31 + c * 17) % 11;
            if c % 5 == 0 || v < 6 {
                0u32
            } else {
                v as u32
            }
        });
        let features = (0..7).map(|i| format!("G{i}")).collect();
        let barcodes = (0..12).map(|i| format!("B{i}")).collect();
        let m = CountMatrix::from_dense("prop", features, barcodes, dense.view()).unwrap();
        let metrics = compute_cell_metrics(&m, "MT-").unwrap();

        for c in 0..m.cols() {
            assert!(metrics.feature_count[c] as usize <= m.rows());
            assert_eq!(metrics.feature_count[c] == 0, metrics.total_count[c] == 0);
        }
    }

    #[test]
    fn test_summary() {
        let metrics = compute_cell_metrics(&example_matrix(), "MT-").unwrap();
        let summary = metrics.summary();
        assert_eq!(summary.num_cells, 4);
        assert_eq!(summary.median_total_count, 3.5);
        assert_eq!(summary.median_feature_count, 1.5);
        assert_eq!(summary.median_mitochondrial_fraction, 0.0);

        let sub = metrics.select(&[2, 0]);
        assert_eq!(sub.total_count, array![6u64, 11]);
    }
}
