//! Highly variable feature selection.
//!
//! `vst` fits the mean-variance trend of the raw counts and scores every feature by the
//! variance of its standardized, clipped counts. `dispersion` bins features by mean
//! expression and z-scores their log dispersion within each bin.

use crate::dispersion::DispersionModel;
use crate::normalization::Normalization;
use crate::stats::row_mean_var;
use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::Array1;
use noisy_float::prelude::n64;
use rayon::prelude::*;
use scan_types::{CountMatrix, NormalizedMatrix, PrepError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

/// Default number of selected features
pub const N_FEATURES_DEFAULT: usize = 2000;
/// Default bound on standardized values
pub const CLIP_DEFAULT: f64 = 10.0;
/// Number of equal-width mean bins of the dispersion method
pub const DISPERSION_BINS: usize = 20;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// variance stabilizing transformation of the raw counts
    #[default]
    Vst,
    /// binned dispersion z-scores of the normalized data
    Dispersion,
}

impl FromStr for SelectionMethod {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vst" => Ok(SelectionMethod::Vst),
            "dispersion" => Ok(SelectionMethod::Dispersion),
            _ => bail!("Selection method not recognized: {}", s),
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionMethod::Vst => "vst",
            SelectionMethod::Dispersion => "dispersion",
        })
    }
}

/// Bound applied to standardized values before scoring: `[-c, c]`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClipRepr", into = "ClipRepr")]
pub enum ClipMax {
    /// square root of the number of cells
    Auto,
    Value(f64),
}

impl Default for ClipMax {
    fn default() -> Self {
        ClipMax::Value(CLIP_DEFAULT)
    }
}

/// JSON form of [`ClipMax`]: a number or `"auto"`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ClipRepr {
    Value(f64),
    Name(String),
}

impl TryFrom<ClipRepr> for ClipMax {
    type Error = String;

    fn try_from(repr: ClipRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ClipRepr::Value(v) => Ok(ClipMax::Value(v)),
            ClipRepr::Name(s) if s == "auto" => Ok(ClipMax::Auto),
            ClipRepr::Name(s) => Err(format!("clip must be a number or \"auto\", got \"{s}\"")),
        }
    }
}

impl From<ClipMax> for ClipRepr {
    fn from(clip: ClipMax) -> Self {
        match clip {
            ClipMax::Auto => ClipRepr::Name("auto".to_string()),
            ClipMax::Value(v) => ClipRepr::Value(v),
        }
    }
}

impl FromStr for ClipMax {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "auto" {
            return Ok(ClipMax::Auto);
        }
        match s.parse::<f64>() {
            Ok(v) => Ok(ClipMax::Value(v)),
            Err(_) => bail!("clip must be a number or \"auto\", got \"{}\"", s),
        }
    }
}

impl ClipMax {
    pub fn validate(&self) -> Result<()> {
        match *self {
            ClipMax::Value(v) if !(v.is_finite() && v > 0.0) => Err(PrepError::Configuration(format!(
                "clip must be positive and finite, got {v}"
            ))),
            _ => Ok(()),
        }
    }

    /// Numeric bound for a matrix of `n_cells` cells
    pub fn resolve(&self, n_cells: usize) -> Result<f64> {
        self.validate()?;
        Ok(match *self {
            ClipMax::Auto => (n_cells as f64).sqrt(),
            ClipMax::Value(v) => v,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VstParams {
    pub n_features: usize,
    pub clip: ClipMax,
}

impl Default for VstParams {
    fn default() -> Self {
        VstParams {
            n_features: N_FEATURES_DEFAULT,
            clip: ClipMax::default(),
        }
    }
}

/// Per feature statistics behind the ranking
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeatureDispersion {
    pub feature: String,
    pub mean: f64,
    pub variance: f64,
    /// Trend variance at `mean`. `None` for constant features and for the dispersion method.
    pub variance_expected: Option<f64>,
    /// Ranking score: standardized variance (vst) or binned dispersion z-score
    pub variance_standardized: f64,
}

/// Features in matrix row order together with their ranking
#[derive(Clone, Debug, PartialEq)]
pub struct VariableFeatureRanking {
    method: SelectionMethod,
    stats: Vec<FeatureDispersion>,
    order: Vec<usize>,
    n_selected: usize,
}

impl VariableFeatureRanking {
    fn new(method: SelectionMethod, stats: Vec<FeatureDispersion>, n_features: usize) -> Self {
        let mut order: Vec<usize> = (0..stats.len()).collect();
        // stable: equal scores keep row order
        order.sort_by_key(|&i| Reverse(n64(stats[i].variance_standardized)));
        let n_selected = n_features.min(stats.len());
        VariableFeatureRanking {
            method,
            stats,
            order,
            n_selected,
        }
    }

    pub fn method(&self) -> SelectionMethod {
        self.method
    }

    /// Statistics in matrix row order
    pub fn stats(&self) -> &[FeatureDispersion] {
        &self.stats
    }

    /// Row indices from most to least variable
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Statistics from most to least variable
    pub fn ranked(&self) -> impl Iterator<Item = &FeatureDispersion> + '_ {
        self.order.iter().map(move |&i| &self.stats[i])
    }

    pub fn n_selected(&self) -> usize {
        self.n_selected
    }

    /// Row indices of the selected features, most variable first
    pub fn selected_indices(&self) -> &[usize] {
        &self.order[..self.n_selected]
    }

    /// Identifiers of the selected features, most variable first
    pub fn selected(&self) -> Vec<&str> {
        self.selected_indices()
            .iter()
            .map(|&i| self.stats[i].feature.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

fn check_cells(n_cells: usize) -> Result<()> {
    if n_cells < 2 {
        return Err(PrepError::NumericFitting(format!(
            "feature variance needs at least 2 cells, got {n_cells}"
        )));
    }
    Ok(())
}

/// Variance stabilizing selection on raw counts.
///
/// For every feature with non-zero variance the trend `log10(variance) ~ log10(mean)` is fit
/// with `model`. Counts are standardized with the trend variance, `z = (x - mean) / sqrt(v)`,
/// clipped to `[-clip, clip]`, and the feature is scored by `sum(z^2) / (n - 1)`.
/// Constant features score 0.
pub fn find_variable_features_vst(
    matrix: &CountMatrix,
    params: &VstParams,
    model: &dyn DispersionModel,
) -> Result<VariableFeatureRanking> {
    let n_cells = matrix.cols();
    check_cells(n_cells)?;
    let clip = params.clip.resolve(n_cells)?;

    let csr = matrix.matrix().to_csr();
    let (means, variances) = row_mean_var(&csr);

    let varying: Vec<usize> = (0..matrix.rows()).filter(|&g| variances[g] > 0.0).collect();
    if varying.is_empty() {
        return Err(PrepError::NumericFitting("all features have zero variance".into()));
    }
    debug!(
        "fitting mean-variance trend on {} of {} features",
        varying.len(),
        matrix.rows()
    );

    let x: Array1<f64> = varying.iter().map(|&g| means[g].log10()).collect();
    let y: Array1<f64> = varying.iter().map(|&g| variances[g].log10()).collect();
    let fitted = model.fit(x.view(), y.view())?;

    let mut expected: Vec<Option<f64>> = vec![None; matrix.rows()];
    for (&g, f) in varying.iter().zip(fitted.iter()) {
        expected[g] = Some(10f64.powf(*f));
    }

    let n = n_cells as f64;
    let scores: Vec<f64> = (0..matrix.rows())
        .into_par_iter()
        .map(|g| {
            let (mean, sd) = match expected[g] {
                Some(v) => (means[g], v.sqrt()),
                None => return 0.0,
            };
            let z2 = |x: f64| ((x - mean) / sd).clamp(-clip, clip).powi(2);
            let (nnz, sum) = match csr.outer_view(g) {
                Some(row) => (row.nnz(), row.data().iter().map(|&x| z2(f64::from(x))).sum::<f64>()),
                None => (0, 0.0),
            };
            (sum + (n_cells - nnz) as f64 * z2(0.0)) / (n - 1.0)
        })
        .collect();

    if let Some(g) = scores.iter().position(|s| !s.is_finite()) {
        return Err(PrepError::NumericFitting(format!(
            "non-finite standardized variance for feature {}",
            matrix.features()[g]
        )));
    }

    let stats = (0..matrix.rows())
        .map(|g| FeatureDispersion {
            feature: matrix.features()[g].clone(),
            mean: means[g],
            variance: variances[g],
            variance_expected: expected[g],
            variance_standardized: scores[g],
        })
        .collect();

    let ranking = VariableFeatureRanking::new(SelectionMethod::Vst, stats, params.n_features);
    info!(
        "vst selected {} of {} features (clip {:.3})",
        ranking.n_selected(),
        ranking.len(),
        clip
    );
    Ok(ranking)
}

/// Bin index of each value over `n_bins` equal-width bins spanning the finite values
fn equal_width_bins(values: &[f64], n_bins: usize) -> Vec<usize> {
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let width = (hi - lo) / n_bins as f64;
    values
        .iter()
        .map(|&v| {
            if width > 0.0 && v.is_finite() {
                (((v - lo) / width).floor() as usize).min(n_bins - 1)
            } else {
                0
            }
        })
        .collect()
}

/// Dispersion selection on normalized data.
///
/// Per feature, mean and variance are taken over the scaled counts: `expm1` of log-normalized
/// values, or relative counts as they are. The feature mean is reported as `ln(1 + mean)` and
/// the dispersion is `ln(variance / mean)`. Features are put into equal-width bins of mean and
/// ranked by the z-score of their dispersion within the bin (the scaled dispersion of
/// Seurat's `mean.var.plot`, not the raw dispersion). Bins with a single feature or no spread
/// score 0; features with zero mean are ranked last.
pub fn find_variable_features_dispersion(
    matrix: &NormalizedMatrix,
    norm: Normalization,
    n_features: usize,
) -> Result<VariableFeatureRanking> {
    check_cells(matrix.cols())?;

    let scaled = match norm {
        Normalization::LogNormalize => matrix.matrix().map(|v| v.exp_m1()),
        Normalization::RelativeCounts => matrix.matrix().clone(),
    };
    let (means, variances) = row_mean_var(&scaled);
    if let Some(g) = (0..matrix.rows()).find(|&g| !(means[g].is_finite() && variances[g].is_finite())) {
        return Err(PrepError::NumericFitting(format!(
            "non-finite mean or variance for feature {}; is the matrix {:?} normalized?",
            matrix.features()[g],
            norm
        )));
    }
    let log_means: Vec<f64> = means.iter().map(|m| m.ln_1p()).collect();
    let dispersions: Vec<f64> = means
        .iter()
        .zip(variances.iter())
        .map(|(&m, &v)| if m > 0.0 { (v / m).ln() } else { f64::NAN })
        .collect();

    let bins = equal_width_bins(&log_means, DISPERSION_BINS);
    let mut members: Vec<Vec<f64>> = vec![Vec::new(); DISPERSION_BINS];
    for (&b, &d) in bins.iter().zip(&dispersions) {
        if d.is_finite() {
            members[b].push(d);
        }
    }
    let bin_stats: Vec<(f64, f64)> = members
        .iter()
        .map(|ds| {
            if ds.len() < 2 {
                return (0.0, 0.0);
            }
            let n = ds.len() as f64;
            let mean = ds.iter().sum::<f64>() / n;
            let var = ds.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
            (mean, var.sqrt())
        })
        .collect();

    let stats = (0..matrix.rows())
        .map(|g| {
            let d = dispersions[g];
            let (bin_mean, bin_sd) = bin_stats[bins[g]];
            let score = if !d.is_finite() {
                f64::NEG_INFINITY
            } else if bin_sd > 0.0 {
                (d - bin_mean) / bin_sd
            } else {
                0.0
            };
            FeatureDispersion {
                feature: matrix.features()[g].clone(),
                mean: log_means[g],
                variance: variances[g],
                variance_expected: None,
                variance_standardized: score,
            }
        })
        .collect();

    let ranking = VariableFeatureRanking::new(SelectionMethod::Dispersion, stats, n_features);
    info!(
        "dispersion selected {} of {} features",
        ranking.n_selected(),
        ranking.len()
    );
    Ok(ranking)
}
