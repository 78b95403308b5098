//! Pipeline options

use crate::dispersion::Loess;
use crate::filter::{FilterPredicate, FEATURE_COUNT_MAX_DEFAULT, FEATURE_COUNT_MIN_DEFAULT, MITO_FRACTION_MAX_DEFAULT};
use crate::normalization::{Normalization, SCALE_FACTOR_DEFAULT};
use crate::qc::MITO_PREFIX_DEFAULT;
use crate::variable_features::{ClipMax, SelectionMethod, VstParams, N_FEATURES_DEFAULT};
use anyhow::{Context, Error};
use scan_types::{PrepError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Every option of the preprocessing pipeline. Missing JSON keys take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrepConfig {
    pub min_cells_per_gene: usize,
    pub min_features_per_cell: usize,
    pub mito_prefix: String,
    pub feature_count_min: f64,
    pub feature_count_max: f64,
    pub mitochondrial_fraction_max: f64,
    pub normalization: Normalization,
    pub scale_factor: f64,
    pub selection_method: SelectionMethod,
    pub n_features: usize,
    pub clip: ClipMax,
    pub loess_span: f64,
}

impl Default for PrepConfig {
    fn default() -> Self {
        PrepConfig {
            min_cells_per_gene: 3,
            min_features_per_cell: 200,
            mito_prefix: MITO_PREFIX_DEFAULT.to_string(),
            feature_count_min: FEATURE_COUNT_MIN_DEFAULT,
            feature_count_max: FEATURE_COUNT_MAX_DEFAULT,
            mitochondrial_fraction_max: MITO_FRACTION_MAX_DEFAULT,
            normalization: Normalization::LogNormalize,
            scale_factor: SCALE_FACTOR_DEFAULT,
            selection_method: SelectionMethod::Vst,
            n_features: N_FEATURES_DEFAULT,
            clip: ClipMax::default(),
            loess_span: 0.3,
        }
    }
}

impl PrepConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> std::result::Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Check every option before any work is done
    pub fn validate(&self) -> Result<()> {
        if self.mito_prefix.is_empty() {
            return Err(PrepError::Configuration("mitochondrial prefix must not be empty".into()));
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(PrepError::Configuration(format!(
                "scale factor must be positive and finite, got {}",
                self.scale_factor
            )));
        }
        self.filter_predicate()?;
        self.clip.validate()?;
        self.dispersion_model().validate()
    }

    pub fn filter_predicate(&self) -> Result<FilterPredicate> {
        FilterPredicate::from_thresholds(
            self.feature_count_min,
            self.feature_count_max,
            self.mitochondrial_fraction_max,
        )
    }

    pub fn vst_params(&self) -> VstParams {
        VstParams {
            n_features: self.n_features,
            clip: self.clip,
        }
    }

    pub fn dispersion_model(&self) -> Loess {
        Loess::new(self.loess_span)
    }
}
