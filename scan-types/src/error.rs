use thiserror::Error;

/// Errors raised by the preprocessing stages. Each stage reports synchronously at its
/// boundary; a failed stage aborts the pipeline with no partial output.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PrepError {
    /// Mismatched dimensions or labels, or an otherwise malformed matrix
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// Invalid thresholds or parameters, detected before any work is done
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A stage received data its upstream stage should have excluded
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The dispersion regression could not be fit on the given data
    #[error("dispersion fit failed: {0}")]
    NumericFitting(String),
}

pub type Result<T> = std::result::Result<T, PrepError>;
