use anyhow::{bail, Error};
use rayon::prelude::*;
use scan_types::{CountMatrix, NormalizedMatrix, PrepError, Result};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::str::FromStr;

/// Default target total count per barcode
pub const SCALE_FACTOR_DEFAULT: f64 = 10_000.0;

/// Normalization scheme for feature-barcode UMI count matrix
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Seurat style log normalization. Barcode UMI count totals are scaled to the
    /// scale factor and the transformation `x -> ln(1 + x)` is applied
    #[default]
    LogNormalize,
    /// Barcode UMI count totals are scaled to the scale factor, no log transform
    RelativeCounts,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "lognormalize" => Ok(Normalization::LogNormalize),
            "relativecounts" => Ok(Normalization::RelativeCounts),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

/// Normalize a count matrix with the given scheme
pub fn normalize(matrix: &CountMatrix, norm: Normalization, scale_factor: f64) -> Result<NormalizedMatrix> {
    match norm {
        Normalization::LogNormalize => log_normalize(matrix, scale_factor),
        Normalization::RelativeCounts => scale_columns(matrix, scale_factor, |x| x),
    }
}

/// Log-normalize a count matrix:
/// 1. Scale each column (barcode) to have the same total UMI count given by `scale_factor`
/// 2. Apply the transform `x -> ln(1 + x)`
///
/// Zero counts stay (implicit) zeros.
pub fn log_normalize(matrix: &CountMatrix, scale_factor: f64) -> Result<NormalizedMatrix> {
    scale_columns(matrix, scale_factor, f64::ln_1p)
}

/// `out[g, c] = f(scale_factor * x[g, c] / total[c])`, computed per barcode in parallel.
/// `f(0)` must be 0 so the sparsity pattern carries over.
fn scale_columns<F>(matrix: &CountMatrix, scale_factor: f64, f: F) -> Result<NormalizedMatrix>
where
    F: Fn(f64) -> f64 + Sync,
{
    if !(scale_factor.is_finite() && scale_factor > 0.0) {
        return Err(PrepError::Configuration(format!(
            "scale factor must be positive and finite, got {scale_factor}"
        )));
    }

    let columns: Vec<Result<Vec<f64>>> = (0..matrix.cols())
        .into_par_iter()
        .map(|c| {
            let col = matrix.column(c);
            let total: u64 = col.data().iter().map(|&v| u64::from(v)).sum();
            if total == 0 {
                return Err(PrepError::PreconditionViolation(format!(
                    "barcode {} has no UMIs and cannot be normalized",
                    matrix.barcodes()[c]
                )));
            }
            let scale = scale_factor / total as f64;
            Ok(col.data().iter().map(|&v| f(scale * f64::from(v))).collect())
        })
        .collect();

    let mut indptr = Vec::with_capacity(matrix.cols() + 1);
    let mut indices = Vec::with_capacity(matrix.nnz());
    let mut data = Vec::with_capacity(matrix.nnz());
    indptr.push(0);
    for (c, values) in columns.into_iter().enumerate() {
        indices.extend_from_slice(matrix.column(c).indices());
        data.extend(values?);
        indptr.push(indices.len());
    }

    matrix.with_values(CsMat::new_csc(matrix.matrix().shape(), indptr, indices, data))
}

#[cfg(test)]
mod test_normalization {
    use super::*;
    use crate::qc::test_qc::example_matrix;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::array;

    #[test]
    fn test_hand_checked_value() {
        let norm = log_normalize(&example_matrix(), SCALE_FACTOR_DEFAULT).unwrap();
        let dense = norm.to_dense();
        // ln(1 + 10000 * 10 / 11)
        assert_approx_eq!(dense[[0, 0]], 9.115, 1e-3);
        assert_approx_eq!(dense[[0, 0]], (1.0 + 10_000.0 * 10.0 / 11.0_f64).ln(), 1e-12);
        assert_approx_eq!(dense[[2, 1]], (10_001.0_f64).ln(), 1e-12);
        assert_eq!(norm.barcodes(), example_matrix().barcodes());
        assert_eq!(norm.features(), example_matrix().features());
    }

    #[test]
    fn test_zeros_preserved() {
        let m = example_matrix();
        let norm = log_normalize(&m, SCALE_FACTOR_DEFAULT).unwrap();
        assert_eq!(norm.nnz(), m.nnz());
        let raw = m.to_dense();
        let dense = norm.to_dense();
        for (r, n) in raw.iter().zip(dense.iter()) {
            if *r == 0 {
                assert_eq!(*n, 0.0);
            }
        }
    }

    #[test]
    fn test_monotonic_within_cell() {
        let dense = array![[1u32, 7], [4, 7], [9, 0], [9, 2]];
        let m = CountMatrix::from_dense(
            "mono",
            (0..4).map(|i| format!("G{i}")).collect(),
            vec!["a".into(), "b".into()],
            dense.view(),
        )
        .unwrap();
        let norm = log_normalize(&m, 100.0).unwrap().to_dense();
        for c in 0..2 {
            for g1 in 0..4 {
                for g2 in 0..4 {
                    if dense[[g1, c]] > dense[[g2, c]] {
                        assert!(norm[[g1, c]] >= norm[[g2, c]]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_relative_counts() {
        let norm = normalize(&example_matrix(), Normalization::RelativeCounts, 100.0).unwrap();
        let dense = norm.to_dense();
        for (c, total) in [11.0, 1.0, 6.0, 1.0].iter().enumerate() {
            let col_sum: f64 = dense.column(c).sum();
            assert_approx_eq!(col_sum, 100.0);
            assert_approx_eq!(dense[[2, c]], 100.0 / total);
        }
    }

    #[test]
    fn test_zero_total_barcode() {
        let dense = array![[0u32, 3], [0, 1]];
        let m = CountMatrix::from_dense("z", vec!["A".into(), "B".into()], vec!["empty".into(), "ok".into()], dense.view())
            .unwrap();
        let err = log_normalize(&m, SCALE_FACTOR_DEFAULT).unwrap_err();
        assert_eq!(
            err,
            PrepError::PreconditionViolation("barcode empty has no UMIs and cannot be normalized".into())
        );
    }

    #[test]
    fn test_bad_scale_factor() {
        for s in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = log_normalize(&example_matrix(), s).unwrap_err();
            assert!(matches!(err, PrepError::Configuration(_)));
        }
    }

    #[test]
    fn test_parse_normalization() {
        assert_eq!("lognormalize".parse::<Normalization>().unwrap(), Normalization::LogNormalize);
        assert_eq!("relativecounts".parse::<Normalization>().unwrap(), Normalization::RelativeCounts);
        assert!("cellranger".parse::<Normalization>().is_err());
    }
}
