//! Barcode and feature filters

use crate::qc::{CellMetrics, QcDataset, QcMetric};
use log::info;
use scan_types::{CountMatrix, PrepError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default lower bound (exclusive) on detected features per barcode
pub const FEATURE_COUNT_MIN_DEFAULT: f64 = 200.0;
/// Default upper bound (exclusive) on detected features per barcode
pub const FEATURE_COUNT_MAX_DEFAULT: f64 = 2500.0;
/// Default upper bound (exclusive) on the mitochondrial percentage
pub const MITO_FRACTION_MAX_DEFAULT: f64 = 5.0;

/// One end of a numeric range
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Inclusive(f64),
    Exclusive(f64),
}

impl Bound {
    pub fn value(self) -> f64 {
        match self {
            Bound::Inclusive(v) | Bound::Exclusive(v) => v,
        }
    }

    fn below(self, x: f64) -> bool {
        match self {
            Bound::Inclusive(v) => v <= x,
            Bound::Exclusive(v) => v < x,
        }
    }

    fn above(self, x: f64) -> bool {
        match self {
            Bound::Inclusive(v) => x <= v,
            Bound::Exclusive(v) => x < v,
        }
    }
}

/// Range constraint on one QC metric. A missing bound leaves that side open.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeConstraint {
    pub metric: QcMetric,
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
}

impl RangeConstraint {
    pub fn above(metric: QcMetric, lower: Bound) -> Self {
        RangeConstraint {
            metric,
            lower: Some(lower),
            upper: None,
        }
    }

    pub fn below(metric: QcMetric, upper: Bound) -> Self {
        RangeConstraint {
            metric,
            lower: None,
            upper: Some(upper),
        }
    }

    pub fn between(metric: QcMetric, lower: Bound, upper: Bound) -> Self {
        RangeConstraint {
            metric,
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    /// True if `x` lies within the range. NaN never does.
    pub fn admits(&self, x: f64) -> bool {
        !x.is_nan() && self.lower.map_or(true, |b| b.below(x)) && self.upper.map_or(true, |b| b.above(x))
    }
}

/// Conjunction of range constraints over QC metrics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilterPredicate {
    constraints: Vec<RangeConstraint>,
}

impl FilterPredicate {
    /// Validates the constraints: bounds must be finite, and on every metric the largest
    /// lower bound must be below the smallest upper bound.
    pub fn new(constraints: Vec<RangeConstraint>) -> Result<Self> {
        let mut ranges: HashMap<QcMetric, (f64, f64)> = HashMap::new();
        for c in &constraints {
            for b in c.lower.iter().chain(c.upper.iter()) {
                if !b.value().is_finite() {
                    return Err(PrepError::Configuration(format!(
                        "bound on {} must be finite, got {}",
                        c.metric,
                        b.value()
                    )));
                }
            }
            let range = ranges.entry(c.metric).or_insert((f64::NEG_INFINITY, f64::INFINITY));
            if let Some(lower) = c.lower {
                range.0 = range.0.max(lower.value());
            }
            if let Some(upper) = c.upper {
                range.1 = range.1.min(upper.value());
            }
            if range.0 >= range.1 {
                return Err(PrepError::Configuration(format!(
                    "lower bound {} on {} is not below upper bound {}",
                    range.0, c.metric, range.1
                )));
            }
        }
        Ok(FilterPredicate { constraints })
    }

    /// `feature_count > min_features`, `feature_count < max_features`,
    /// `mitochondrial_fraction < max_mito`
    pub fn from_thresholds(min_features: f64, max_features: f64, max_mito: f64) -> Result<Self> {
        FilterPredicate::new(vec![
            RangeConstraint::above(QcMetric::FeatureCount, Bound::Exclusive(min_features)),
            RangeConstraint::below(QcMetric::FeatureCount, Bound::Exclusive(max_features)),
            RangeConstraint::below(QcMetric::MitochondrialFraction, Bound::Exclusive(max_mito)),
        ])
    }

    pub fn constraints(&self) -> &[RangeConstraint] {
        &self.constraints
    }

    /// True if barcode `cell` satisfies every constraint
    pub fn admits(&self, metrics: &CellMetrics, cell: usize) -> bool {
        self.constraints.iter().all(|c| c.admits(metrics.get(c.metric, cell)))
    }
}

impl Default for FilterPredicate {
    fn default() -> Self {
        FilterPredicate {
            constraints: vec![
                RangeConstraint::above(QcMetric::FeatureCount, Bound::Exclusive(FEATURE_COUNT_MIN_DEFAULT)),
                RangeConstraint::below(QcMetric::FeatureCount, Bound::Exclusive(FEATURE_COUNT_MAX_DEFAULT)),
                RangeConstraint::below(QcMetric::MitochondrialFraction, Bound::Exclusive(MITO_FRACTION_MAX_DEFAULT)),
            ],
        }
    }
}

/// Keep the barcodes whose metrics satisfy `predicate`. Features and the relative order of
/// the retained barcodes are unchanged.
pub fn filter_cells(matrix: &CountMatrix, metrics: &CellMetrics, predicate: &FilterPredicate) -> Result<QcDataset> {
    if metrics.len() != matrix.cols() {
        return Err(PrepError::InputValidation(format!(
            "{} barcode metrics for a matrix of {} barcodes",
            metrics.len(),
            matrix.cols()
        )));
    }

    let keep: Vec<usize> = (0..matrix.cols()).filter(|&c| predicate.admits(metrics, c)).collect();
    info!("cell filter kept {} of {} barcodes", keep.len(), matrix.cols());

    Ok(QcDataset {
        matrix: matrix.select_columns(&keep)?,
        metrics: metrics.select(&keep),
    })
}

/// Drop barcodes with fewer than `min_features_per_cell` detected features, then features
/// detected in fewer than `min_cells_per_gene` of the remaining barcodes.
pub fn prefilter(matrix: &CountMatrix, min_cells_per_gene: usize, min_features_per_cell: usize) -> Result<CountMatrix> {
    let detected = |c: usize| matrix.column(c).data().iter().filter(|&&v| v > 0).count();
    let cols: Vec<usize> = (0..matrix.cols())
        .filter(|&c| detected(c) >= min_features_per_cell)
        .collect();

    let mut cells_per_gene = vec![0usize; matrix.rows()];
    for &c in &cols {
        for (r, &v) in matrix.column(c).iter() {
            if v > 0 {
                cells_per_gene[r] += 1;
            }
        }
    }
    let rows: Vec<usize> = (0..matrix.rows())
        .filter(|&r| cells_per_gene[r] >= min_cells_per_gene)
        .collect();
    info!(
        "prefilter kept {} of {} features and {} of {} barcodes",
        rows.len(),
        matrix.rows(),
        cols.len(),
        matrix.cols()
    );

    matrix.select_columns(&cols)?.select_rows(&rows)
}
