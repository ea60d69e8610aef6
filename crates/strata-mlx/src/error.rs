//! Error types for strata-mlx operations.

use strata_core::StrataError;
use thiserror::Error;

/// Result type alias for strata-mlx operations.
pub type Result<T> = std::result::Result<T, MlxError>;

/// Errors that can occur in strata-mlx operations.
#[derive(Debug, Error)]
pub enum MlxError {
    /// MLX exception.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid argument, such as trimming past retained history.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Buffer growth could not obtain memory.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Shape mismatch.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        actual: String,
    },

    /// Disagreement between components that indicates an integration defect.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Error raised by the core crate.
    #[error(transparent)]
    Core(#[from] StrataError),
}

impl MlxError {
    /// Shape mismatch from two shapes.
    pub fn shape(expected: &[i32], actual: &[i32]) -> Self {
        MlxError::ShapeMismatch {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

impl From<MlxError> for StrataError {
    fn from(err: MlxError) -> Self {
        match err {
            MlxError::Mlx(e) => StrataError::Mlx(e.to_string()),
            MlxError::InvalidConfig(msg) => StrataError::Config(msg),
            MlxError::InvalidArgument(msg) => StrataError::InvalidArgument(msg),
            MlxError::Allocation(msg) => StrataError::Allocation(msg),
            MlxError::ShapeMismatch { expected, actual } => StrataError::InvariantViolation(
                format!("shape mismatch: expected {expected}, got {actual}"),
            ),
            MlxError::InvariantViolation(msg) => StrataError::InvariantViolation(msg),
            MlxError::Core(e) => e,
        }
    }
}
