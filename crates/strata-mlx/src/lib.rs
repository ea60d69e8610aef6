//! MLX decode-time core for strata.
//!
//! This crate provides the memory and dispatch components of autoregressive
//! decoding on top of mlx-rs:
//!
//! - KV caches: standard (amortized growth), rotating (window plus sink
//!   tokens) and group-quantized
//! - Rotary position embeddings with context-extension scalings
//! - Attention masks consistent with each cache's history
//! - Scaled dot-product attention with GQA and attention sinks
//! - Mixture of Experts routing and sort-based expert dispatch

#![warn(missing_docs)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::manual_div_ceil)]

pub mod error;
pub mod expert_dispatch;
pub mod kernels;
pub mod kv_cache;
pub mod mask;
pub mod moe;
pub mod quantization;

pub use error::{MlxError, Result};
pub use expert_dispatch::*;
pub use kv_cache::*;
pub use mask::*;
pub use moe::*;

// Re-export mlx-rs types for convenience
pub use mlx_rs::{Array, Dtype};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::expert_dispatch::{DispatchStats, ExpertDispatcher, ExpertWeights};
    pub use crate::kernels::{attend, RotaryEncoder};
    pub use crate::kv_cache::{KVCache, LayerCache};
    pub use crate::mask::{create_attention_mask, create_causal_mask, AttentionMask};
    pub use crate::moe::{ExpertAssignment, ExpertRouter, MoeLayer};
    pub use mlx_rs::{Array, Dtype};
}
