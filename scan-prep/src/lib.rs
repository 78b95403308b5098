//! # scan-prep: single cell count matrix preprocessing
//!
//! Quality control, cell filtering, normalization and highly variable feature selection
//! over sparse feature x barcode matrices.

pub mod config;
pub mod dispersion;
pub mod filter;
mod linalg;
pub mod mtx;

/// Count matrix normalization methods
pub mod normalization;

/// End-to-end preprocessing
pub mod pipeline;

pub mod qc;
pub mod stats;
pub mod variable_features;

pub use config::PrepConfig;
pub use pipeline::{run_pipeline, run_pipeline_with_model, PipelineOutput};
