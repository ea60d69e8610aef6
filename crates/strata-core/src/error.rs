//! Error types for strata.

use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata operations.
///
/// Cancellation is not represented here: a caller asking the decode loop to
/// stop is a normal termination and is reported through the stop reason.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed or missing configuration, detected before a session starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache growth could not obtain memory.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Shape or rank disagreement between components.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Degenerate sampling distribution.
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// MLX backend errors.
    #[error("MLX error: {0}")]
    Mlx(String),
}

impl StrataError {
    /// Whether the error is fatal for the session that raised it.
    ///
    /// Only sampling errors are recovered locally by the decode loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StrataError::Sampling(_))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}
