//! prefilter -> QC -> cell filter -> normalize -> variable features

use crate::config::PrepConfig;
use crate::dispersion::DispersionModel;
use crate::filter::{filter_cells, prefilter};
use crate::normalization::normalize;
use crate::qc::{compute_cell_metrics, QcDataset};
use crate::variable_features::{
    find_variable_features_dispersion, find_variable_features_vst, SelectionMethod, VariableFeatureRanking,
};
use itertools::Itertools;
use log::info;
use scan_types::{CountMatrix, NormalizedMatrix, Result};

/// Artifacts of a pipeline run
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutput {
    /// Filtered counts and the metrics of the retained barcodes
    pub qc: QcDataset,
    pub normalized: NormalizedMatrix,
    pub ranking: VariableFeatureRanking,
}

/// Run every stage with the loess mean-variance trend configured in `config`
pub fn run_pipeline(matrix: &CountMatrix, config: &PrepConfig) -> Result<PipelineOutput> {
    run_pipeline_with_model(matrix, config, &config.dispersion_model())
}

/// Run every stage, fitting the vst mean-variance trend with `model`. The configuration is
/// validated before any stage runs; the first failing stage aborts the run.
pub fn run_pipeline_with_model(
    matrix: &CountMatrix,
    config: &PrepConfig,
    model: &dyn DispersionModel,
) -> Result<PipelineOutput> {
    config.validate()?;
    let predicate = config.filter_predicate()?;
    info!(
        "input matrix {}: {} features x {} barcodes",
        matrix.name(),
        matrix.rows(),
        matrix.cols()
    );

    let matrix = prefilter(matrix, config.min_cells_per_gene, config.min_features_per_cell)?;

    let metrics = compute_cell_metrics(&matrix, &config.mito_prefix)?;
    let summary = metrics.summary();
    info!(
        "before filtering: median total count {}, median features {}, median mitochondrial % {:.2}",
        summary.median_total_count, summary.median_feature_count, summary.median_mitochondrial_fraction
    );

    let qc = filter_cells(&matrix, &metrics, &predicate)?;
    let normalized = normalize(&qc.matrix, config.normalization, config.scale_factor)?;

    let ranking = match config.selection_method {
        SelectionMethod::Vst => find_variable_features_vst(&qc.matrix, &config.vst_params(), model)?,
        SelectionMethod::Dispersion => {
            find_variable_features_dispersion(&normalized, config.normalization, config.n_features)?
        }
    };
    info!(
        "{} variable features, top: {}",
        ranking.n_selected(),
        ranking.selected().iter().take(10).join(", ")
    );

    Ok(PipelineOutput {
        qc,
        normalized,
        ranking,
    })
}

#[cfg(test)]
mod test_pipeline {
    use super::*;
    use crate::dispersion::GlobalPolynomial;
    use crate::normalization::Normalization;
    use crate::variable_features::ClipMax;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use rand_pcg::Pcg64Mcg;
    use scan_types::PrepError;

    /// 50 genes x 60 cells. Two mitochondrial genes; cells 0-4 are dominated by them and
    /// gene 2 carries a few large spikes.
    fn synthetic_matrix() -> CountMatrix {
        let (n_genes, n_cells) = (50, 60);
        let mut rng = Pcg64Mcg::seed_from_u64(2024);
        let mut dense = Array2::<u32>::zeros((n_genes, n_cells));
        for g in 0..n_genes {
            let lambda = if g < 2 { 0.3 } else { 0.5 + 0.1 * g as f64 };
            let poisson = Poisson::new(lambda).unwrap();
            for c in 0..n_cells {
                dense[[g, c]] = poisson.sample(&mut rng) as u32;
            }
        }
        for c in 0..5 {
            dense[[0, c]] = 100;
            dense[[1, c]] = 100;
        }
        for c in [7, 21, 40] {
            dense[[2, c]] = 30;
        }

        let features = (0..n_genes)
            .map(|g| if g < 2 { format!("MT-{g}") } else { format!("GENE{g}") })
            .collect();
        let barcodes = (0..n_cells).map(|c| format!("BC{c}-1")).collect();
        CountMatrix::from_dense("synthetic", features, barcodes, dense.view()).unwrap()
    }

    fn small_config() -> PrepConfig {
        PrepConfig {
            min_features_per_cell: 5,
            feature_count_min: 5.0,
            feature_count_max: 100.0,
            mitochondrial_fraction_max: 20.0,
            n_features: 10,
            ..PrepConfig::default()
        }
    }

    #[test]
    fn test_end_to_end() {
        let m = synthetic_matrix();
        let out = run_pipeline(&m, &small_config()).unwrap();

        let expected: Vec<String> = (5..60).map(|c| format!("BC{c}-1")).collect();
        assert_eq!(out.qc.matrix.barcodes(), expected.as_slice());
        assert_eq!(out.qc.metrics.len(), 55);
        assert!(out.qc.metrics.mitochondrial_fraction.iter().all(|&f| f < 20.0));

        assert_eq!(out.normalized.barcodes(), out.qc.matrix.barcodes());
        assert_eq!(out.normalized.features(), out.qc.matrix.features());
        assert_eq!(out.normalized.nnz(), out.qc.matrix.nnz());

        assert_eq!(out.ranking.len(), out.qc.matrix.rows());
        assert_eq!(out.ranking.selected().len(), 10);
        assert_eq!(out.ranking.selected()[0], "GENE2");
    }

    #[test]
    fn test_alternative_methods() {
        let m = synthetic_matrix();
        let config = PrepConfig {
            clip: ClipMax::Auto,
            ..small_config()
        };
        let out = run_pipeline_with_model(&m, &config, &GlobalPolynomial { degree: 2 }).unwrap();
        assert_eq!(out.ranking.selected().len(), 10);
        assert_eq!(out.ranking.method(), SelectionMethod::Vst);

        let config = PrepConfig {
            selection_method: SelectionMethod::Dispersion,
            ..small_config()
        };
        let out = run_pipeline(&m, &config).unwrap();
        assert_eq!(out.ranking.method(), SelectionMethod::Dispersion);
        assert_eq!(out.ranking.len(), out.normalized.rows());
    }

    #[test]
    fn test_dispersion_with_relative_counts() {
        let config = PrepConfig {
            normalization: Normalization::RelativeCounts,
            selection_method: SelectionMethod::Dispersion,
            ..small_config()
        };
        let out = run_pipeline(&synthetic_matrix(), &config).unwrap();
        assert_eq!(out.ranking.len(), out.normalized.rows());
        assert!(out
            .ranking
            .stats()
            .iter()
            .all(|s| s.mean.is_finite() && s.variance.is_finite() && s.variance_standardized.is_finite()));

        let log = run_pipeline(
            &synthetic_matrix(),
            &PrepConfig {
                selection_method: SelectionMethod::Dispersion,
                ..small_config()
            },
        )
        .unwrap();
        assert_eq!(out.ranking.selected(), log.ranking.selected());
    }

    #[test]
    fn test_invalid_config_fails_first() {
        let config = PrepConfig {
            feature_count_min: 500.0,
            ..small_config()
        };
        let err = run_pipeline(&synthetic_matrix(), &config).unwrap_err();
        assert!(matches!(err, PrepError::Configuration(_)));
    }

    #[test]
    fn test_everything_filtered() {
        let config = PrepConfig {
            feature_count_min: 99.0,
            ..small_config()
        };
        let err = run_pipeline(&synthetic_matrix(), &config).unwrap_err();
        assert!(matches!(err, PrepError::NumericFitting(_)));
    }
}
