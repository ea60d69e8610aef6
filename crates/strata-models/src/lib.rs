//! Sampling, decode loop and sessions for strata.
//!
//! This crate drives the kernels of `strata-mlx`:
//! - [`Sampler`]: temperature, top-k, top-p, min-p and repetition penalty
//! - [`DecodeLoop`]: prefill, per-token decode and stop handling
//! - [`Session`]: one model plus its per-layer cache
//! - [`TinyMoeModel`]: a small random-weight MoE decoder
//!
//! All architectures implement the [`CausalLM`] trait.
//!
//! [`CausalLM`]: traits::CausalLM
//! [`TinyMoeModel`]: architectures::TinyMoeModel

#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

pub mod architectures;
pub mod error;
pub mod generation;
pub mod session;
pub mod traits;

// Re-exports for convenience
pub use error::{ModelError, Result};
pub use generation::*;
pub use session::Session;
pub use traits::CausalLM;
