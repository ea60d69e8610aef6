//! Core traits for causal language models.
//!
//! A model owns its weights; the session owns the cache. Every forward pass
//! receives the cache explicitly so that one model value can never advance
//! two histories at once.

use mlx_rs::Array;
use strata_core::SessionConfig;
use strata_mlx::KVCache;

use crate::error::Result;

/// Causal language model driven by a decode session.
///
/// Note: This trait intentionally does not require `Send + Sync` because
/// MLX arrays contain raw pointers that are not thread-safe.
pub trait CausalLM {
    /// Shape and runtime configuration the model was built for.
    fn config(&self) -> &SessionConfig;

    /// Forward pass producing logits.
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs of shape `[batch, seq_len]`
    /// * `cache` - Per-layer cache, advanced by `seq_len` tokens
    ///
    /// # Returns
    /// Logits of shape `[batch, seq_len, vocab_size]`
    fn forward(&mut self, input_ids: &Array, cache: &mut KVCache) -> Result<Array>;
}
