//! Labeled sparse matrix types and errors shared by the preprocessing crates

/// Errors raised by preprocessing stages
pub mod error;

/// Feature x barcode matrices with their labels
pub mod matrix;

pub use error::{PrepError, Result};
pub use matrix::{CountMatrix, GenericFeatureBarcodeMatrix, MatrixMetadata, NormalizedMatrix};
