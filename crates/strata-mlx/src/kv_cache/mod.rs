//! Key-Value cache for efficient autoregressive inference.
//!
//! KV caching stores previously computed key and value tensors during
//! generation so that each decode step only computes attention inputs for the
//! newest token.
//!
//! ## Tensor Format
//!
//! Keys/values are passed in attention format `[B, heads, seq, head_dim]`
//! with the sequence on axis 2, matching mlx_lm.
//!
//! ## Layouts
//!
//! Each layer owns one [`LayerCache`], a closed set of layouts behind one
//! interface:
//!
//! - [`StandardCache`]: keeps every token, growing in steps of
//!   [`CACHE_STEP_SIZE`] slots
//! - [`RotatingCache`]: fixed window plus sink tokens that are never evicted
//! - [`QuantizedCache`]: group-quantized storage, dequantized on read
//!
//! [`KVCache`] holds one entry per layer and applies rollback to all layers
//! at once.
//!
//! ## Usage
//!
//! ```ignore
//! let mut cache = KVCache::new(num_layers, &CacheConfig::default())?;
//! let mask = cache.make_mask(layer_idx, seq_len, None)?;
//! let (keys, values) = cache.update_and_fetch(layer_idx, &new_keys, &new_values)?;
//! ```

mod quantized;
mod rotating;
mod standard;

pub use quantized::QuantizedCache;
pub use rotating::RotatingCache;
pub use standard::StandardCache;

use crate::error::{MlxError, Result};
use crate::mask::{create_causal_mask, AttentionMask};
use mlx_rs::Array;
use strata_core::{CacheConfig, CacheKind, SessionConfig};

/// Growth step size in tokens (matches Python mlx-lm).
pub const CACHE_STEP_SIZE: usize = 256;

/// Per-layer key/value history.
#[derive(Debug, Clone)]
pub enum LayerCache {
    /// Growing cache of every token.
    Standard(StandardCache),
    /// Fixed window with sink tokens.
    Rotating(RotatingCache),
    /// Group-quantized cache.
    Quantized(QuantizedCache),
}

impl LayerCache {
    /// Create an empty cache from a validated configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config.kind {
            CacheKind::Standard => {
                LayerCache::Standard(StandardCache::new(config.step, config.max_capacity))
            }
            CacheKind::Rotating => LayerCache::Rotating(RotatingCache::new(
                config.window,
                config.keep,
                config.step,
            )),
            CacheKind::Quantized => LayerCache::Quantized(QuantizedCache::new(
                config.bits,
                config.group_size,
                config.step,
                config.max_capacity,
            )?),
        })
    }

    /// Layout of this cache.
    pub fn kind(&self) -> CacheKind {
        match self {
            LayerCache::Standard(_) => CacheKind::Standard,
            LayerCache::Rotating(_) => CacheKind::Rotating,
            LayerCache::Quantized(_) => CacheKind::Quantized,
        }
    }

    /// Append this step's keys/values and return the history used for attention.
    pub fn update_and_fetch(&mut self, keys: &Array, values: &Array) -> Result<(Array, Array)> {
        match self {
            LayerCache::Standard(c) => c.update_and_fetch(keys, values),
            LayerCache::Rotating(c) => c.update_and_fetch(keys, values),
            LayerCache::Quantized(c) => c.update_and_fetch(keys, values),
        }
    }

    /// Number of retained tokens.
    pub fn offset(&self) -> usize {
        match self {
            LayerCache::Standard(c) => c.offset(),
            LayerCache::Rotating(c) => c.offset(),
            LayerCache::Quantized(c) => c.offset(),
        }
    }

    /// Absolute position of the next token, used as the RoPE offset.
    pub fn rope_offset(&self) -> usize {
        match self {
            LayerCache::Rotating(c) => c.total_tokens(),
            _ => self.offset(),
        }
    }

    /// Allocated slots.
    pub fn capacity(&self) -> usize {
        match self {
            LayerCache::Standard(c) => c.capacity(),
            LayerCache::Rotating(c) => c.allocated(),
            LayerCache::Quantized(c) => c.capacity(),
        }
    }

    /// Largest `n` that [`Self::trim`] accepts.
    pub fn trimmable(&self) -> usize {
        match self {
            LayerCache::Standard(c) => c.offset(),
            LayerCache::Rotating(c) => c.trimmable(),
            LayerCache::Quantized(c) => c.offset(),
        }
    }

    /// Remove the last `n` tokens.
    pub fn trim(&mut self, n: usize) -> Result<usize> {
        match self {
            LayerCache::Standard(c) => c.trim(n),
            LayerCache::Rotating(c) => c.trim(n),
            LayerCache::Quantized(c) => c.trim(n),
        }
    }

    /// Mask for the next step of `query_len` tokens.
    pub fn make_mask(&self, query_len: usize, window: Option<usize>) -> Result<AttentionMask> {
        match self {
            LayerCache::Rotating(c) => c.make_mask(query_len, window),
            _ => contiguous_mask(self.offset(), query_len, window),
        }
    }

    /// Drop all history and free buffers.
    pub fn reset(&mut self) {
        match self {
            LayerCache::Standard(c) => c.reset(),
            LayerCache::Rotating(c) => c.reset(),
            LayerCache::Quantized(c) => c.reset(),
        }
    }

    /// Bytes held by the cache buffers.
    pub fn memory_usage(&self) -> usize {
        match self {
            LayerCache::Standard(c) => c.memory_usage(),
            LayerCache::Rotating(c) => c.memory_usage(),
            LayerCache::Quantized(c) => c.memory_usage(),
        }
    }
}

/// Key-Value cache for all transformer layers of one session.
#[derive(Debug, Clone)]
pub struct KVCache {
    layers: Vec<LayerCache>,
}

impl KVCache {
    /// Create a cache with the same layout for every layer.
    pub fn new(num_layers: usize, config: &CacheConfig) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|_| LayerCache::from_config(config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Create a cache with one layout per layer.
    pub fn from_layer_configs(configs: &[CacheConfig]) -> Result<Self> {
        let layers = configs
            .iter()
            .map(LayerCache::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Create the cache a session needs, with rotating caches on local layers.
    pub fn for_session(config: &SessionConfig) -> Result<Self> {
        let configs: Vec<CacheConfig> = (0..config.num_layers)
            .map(|layer| config.cache_for_layer(layer))
            .collect();
        Self::from_layer_configs(&configs)
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Cache of one layer.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    /// Mutable cache of one layer.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(layer_idx)
    }

    fn checked_layer(&self, layer_idx: usize) -> Result<&LayerCache> {
        self.layers.get(layer_idx).ok_or_else(|| {
            MlxError::InvalidArgument(format!(
                "Layer index {} out of range (num_layers={})",
                layer_idx,
                self.layers.len()
            ))
        })
    }

    /// Update one layer and return its attention history.
    pub fn update_and_fetch(
        &mut self,
        layer_idx: usize,
        new_keys: &Array,
        new_values: &Array,
    ) -> Result<(Array, Array)> {
        self.checked_layer(layer_idx)?;
        self.layers[layer_idx].update_and_fetch(new_keys, new_values)
    }

    /// Mask for the next step of one layer.
    pub fn make_mask(
        &self,
        layer_idx: usize,
        query_len: usize,
        window: Option<usize>,
    ) -> Result<AttentionMask> {
        self.checked_layer(layer_idx)?.make_mask(query_len, window)
    }

    /// Retained tokens of the first layer.
    pub fn offset(&self) -> usize {
        self.layers.first().map(LayerCache::offset).unwrap_or(0)
    }

    /// Absolute position of the next token.
    pub fn rope_offset(&self) -> usize {
        self.layers.first().map(LayerCache::rope_offset).unwrap_or(0)
    }

    /// Whether no tokens are stored.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|c| c.offset() == 0)
    }

    /// Whether every layer can roll back at least one token.
    pub fn is_trimmable(&self) -> bool {
        !self.layers.is_empty() && self.layers.iter().all(|c| c.trimmable() > 0)
    }

    /// Roll every layer back by `n` tokens.
    ///
    /// Either every layer is trimmed or none is.
    pub fn trim(&mut self, n: usize) -> Result<usize> {
        if let Some(limit) = self.layers.iter().map(LayerCache::trimmable).min() {
            if n > limit {
                return Err(MlxError::InvalidArgument(format!(
                    "cannot trim {n} tokens, only {limit} retained"
                )));
            }
        }
        for layer in &mut self.layers {
            layer.trim(n)?;
        }
        Ok(n)
    }

    /// Reset every layer.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }

    /// Bytes held by all layers.
    pub fn memory_usage(&self) -> usize {
        self.layers.iter().map(LayerCache::memory_usage).sum()
    }
}

/// Mask for caches that keep history contiguous from position 0.
pub(crate) fn contiguous_mask(
    offset: usize,
    query_len: usize,
    window: Option<usize>,
) -> Result<AttentionMask> {
    if query_len == 0 {
        return Err(MlxError::InvalidArgument("query_len must be positive".into()));
    }
    let windowed = match window {
        Some(0) => return Err(MlxError::InvalidArgument("window must be positive".into())),
        // Binds once the newest query could see further back than the window.
        Some(w) => offset + query_len > w,
        None => false,
    };
    if query_len == 1 && !windowed {
        return Ok(AttentionMask::None);
    }
    if windowed {
        Ok(AttentionMask::SlidingWindow(create_causal_mask(
            query_len, offset, window,
        )?))
    } else {
        Ok(AttentionMask::Causal(create_causal_mask(query_len, offset, None)?))
    }
}

/// Validate a key/value pair and return `(batch, heads, seq_len)`.
pub(crate) fn check_update(keys: &Array, values: &Array) -> Result<(i32, i32, usize)> {
    if keys.ndim() != 4 || values.ndim() != 4 {
        return Err(MlxError::InvariantViolation(format!(
            "cache update expects rank-4 keys/values, got ranks {} and {}",
            keys.ndim(),
            values.ndim()
        )));
    }
    let (ks, vs) = (keys.shape(), values.shape());
    if ks[..3] != vs[..3] {
        return Err(MlxError::shape(&ks[..3], &vs[..3]));
    }
    if ks[2] == 0 {
        return Err(MlxError::InvalidArgument("empty cache update".into()));
    }
    if ks[3] == 0 || vs[3] == 0 {
        return Err(MlxError::InvalidArgument(format!(
            "head_dim must be positive, got keys {} and values {}",
            ks[3], vs[3]
        )));
    }
    Ok((ks[0], ks[1], ks[2] as usize))
}

/// Ensure a new update matches the layout of the stored buffer.
pub(crate) fn check_layout(stored: &Array, update: &Array) -> Result<()> {
    let (s, u) = (stored.shape(), update.shape());
    if s[0] != u[0] || s[1] != u[1] || s[3] != u[3] {
        return Err(MlxError::shape(&[s[0], s[1], u[2], s[3]], u));
    }
    Ok(())
}
