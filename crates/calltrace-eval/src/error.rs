//! Error types for calltrace-eval

use calltrace_core::BackendError;
use thiserror::Error;

/// Evaluation errors.
///
/// `Dataset`, `Config` and `Backend` abort an evaluation. The others only ever
/// describe a single row or scorer and are recorded in that row's result.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Dataset cannot be read or is malformed
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Invalid evaluation configuration
    #[error("Invalid evaluation configuration: {0}")]
    Config(String),

    /// A referenced object could not be resolved
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Column mapping points at a column the row does not have
    #[error("Column '{column}' mapped to parameter '{param}' not found in row")]
    Mapping { param: String, column: String },

    /// Row cannot be bound to the declared input type
    #[error("Cannot bind row to {target}: {message}")]
    Binding { target: &'static str, message: String },

    /// Scorer returned something that is not a score
    #[error("Invalid score: {0}")]
    Score(String),
}

/// Result type for evaluation operations
pub type EvalResult<T> = Result<T, EvalError>;
