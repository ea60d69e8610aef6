//! Error types for model execution and generation.

use mlx_rs::error::Exception;
use strata_core::StrataError;
use strata_mlx::MlxError;
use thiserror::Error;

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while running a model or a decode loop.
#[derive(Error, Debug)]
pub enum ModelError {
    /// MLX backend error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Cache, attention, routing or dispatch error.
    #[error(transparent)]
    Kernel(#[from] MlxError),

    /// Configuration or sampling error.
    #[error(transparent)]
    Core(#[from] StrataError),

    /// Caller supplied unusable input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<ModelError> for StrataError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Mlx(e) => StrataError::Mlx(e.to_string()),
            ModelError::Kernel(e) => e.into(),
            ModelError::Core(e) => e,
            ModelError::InvalidInput(msg) => StrataError::InvalidArgument(msg),
        }
    }
}
