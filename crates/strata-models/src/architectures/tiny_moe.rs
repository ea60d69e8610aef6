//! Small Mixture-of-Experts decoder with random weights.
//!
//! Implements the decode path of a sink-attention MoE transformer:
//! - Pre-norm decoder blocks (RMSNorm)
//! - Grouped query attention with rotary embeddings and per-layer caches
//! - Sliding window attention on the layers listed in the config
//! - Optional learned per-head attention sinks
//! - Routed expert MLP (top-k router, sort-based dispatch)
//!
//! Weights are randomly initialised; the model exists to drive every
//! component of a session end to end.

use mlx_rs::{builder::Builder, module::Module, nn, Array};
use strata_core::{SessionConfig, StrataError};
use strata_mlx::{
    kernels::{attend, RotaryEncoder},
    DispatchStats, KVCache, MlxError, MoeLayer,
};

use crate::error::Result;
use crate::traits::CausalLM;

/// Attention block.
#[derive(Debug)]
pub struct TinyAttention {
    n_heads: i32,
    n_kv_heads: i32,
    head_dim: i32,
    scale: f32,
    window: Option<usize>,
    rope: RotaryEncoder,
    /// Per-head sink logits.
    sinks: Option<Array>,
    /// Query projection.
    pub q_proj: nn::Linear,
    /// Key projection.
    pub k_proj: nn::Linear,
    /// Value projection.
    pub v_proj: nn::Linear,
    /// Output projection.
    pub o_proj: nn::Linear,
}

impl TinyAttention {
    /// Create the attention block for `layer_idx`.
    pub fn new(config: &SessionConfig, layer_idx: usize) -> Result<Self> {
        let hidden = config.hidden_size as i32;
        let n_heads = config.num_heads as i32;
        let n_kv_heads = config.num_kv_heads as i32;
        let head_dim = config.head_dim as i32;

        let q_proj = nn::LinearBuilder::new(hidden, n_heads * head_dim).bias(false).build()?;
        let k_proj = nn::LinearBuilder::new(hidden, n_kv_heads * head_dim).bias(false).build()?;
        let v_proj = nn::LinearBuilder::new(hidden, n_kv_heads * head_dim).bias(false).build()?;
        let o_proj = nn::LinearBuilder::new(n_heads * head_dim, hidden).bias(false).build()?;

        let window = if config.sliding_window_layers.contains(&layer_idx) {
            config.sliding_window
        } else {
            None
        };
        let sinks = if config.attention_sinks {
            Some(mlx_rs::random::normal::<f32>(&[n_heads], None, None, None)?)
        } else {
            None
        };

        Ok(Self {
            n_heads,
            n_kv_heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
            window,
            rope: RotaryEncoder::new(&config.rope)?,
            sinks,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
        })
    }

    /// Attention window of this layer, if local.
    pub fn window(&self) -> Option<usize> {
        self.window
    }

    /// Forward `[batch, seq, hidden]` through attention, advancing `cache` at `layer_idx`.
    pub fn forward(&mut self, x: &Array, cache: &mut KVCache, layer_idx: usize) -> Result<Array> {
        let (batch, seq_len) = (x.dim(0), x.dim(1));

        let q = self
            .q_proj
            .forward(x)?
            .reshape(&[batch, seq_len, self.n_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;

        let offset = cache
            .layer(layer_idx)
            .map(|c| c.rope_offset())
            .ok_or_else(|| {
                MlxError::InvalidArgument(format!("no cache for layer {layer_idx}"))
            })?;
        let q = self.rope.apply(&q, offset)?;
        let k = self.rope.apply(&k, offset)?;

        // The mask describes the history the update below returns.
        let mask = cache.make_mask(layer_idx, seq_len as usize, self.window)?;
        let (keys, values) = cache.update_and_fetch(layer_idx, &k, &v)?;
        let out = attend(&q, &keys, &values, self.scale, &mask, self.sinks.as_ref())?;

        let out = out
            .transpose_axes(&[0, 2, 1, 3])?
            .reshape(&[batch, seq_len, self.n_heads * self.head_dim])?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// Pre-norm decoder block with a routed MLP.
#[derive(Debug)]
pub struct TinyDecoderLayer {
    /// Self-attention.
    pub self_attn: TinyAttention,
    /// Routed experts.
    pub mlp: MoeLayer,
    /// Input layer norm.
    pub input_layernorm: nn::RmsNorm,
    /// Post-attention layer norm.
    pub post_attention_layernorm: nn::RmsNorm,
}

impl TinyDecoderLayer {
    fn new(config: &SessionConfig, layer_idx: usize) -> Result<Self> {
        let moe = config.moe.as_ref().ok_or_else(|| {
            StrataError::Config("TinyMoeModel requires an moe section".into())
        })?;
        let mlp = MoeLayer::new_random(
            config.hidden_size as i32,
            config.intermediate_size as i32,
            moe,
        )?;
        let input_layernorm = nn::RmsNormBuilder::new(config.hidden_size as i32)
            .eps(config.rms_norm_eps)
            .build()?;
        let post_attention_layernorm = nn::RmsNormBuilder::new(config.hidden_size as i32)
            .eps(config.rms_norm_eps)
            .build()?;
        Ok(Self {
            self_attn: TinyAttention::new(config, layer_idx)?,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &mut self,
        x: &Array,
        cache: &mut KVCache,
        layer_idx: usize,
    ) -> Result<(Array, DispatchStats)> {
        let hidden = self.input_layernorm.forward(x)?;
        let hidden = self.self_attn.forward(&hidden, cache, layer_idx)?;
        let hidden = x.add(&hidden)?;

        let normed = self.post_attention_layernorm.forward(&hidden)?;
        let (mlp_out, stats) = self.mlp.forward(&normed)?;
        Ok((hidden.add(&mlp_out)?, stats))
    }
}

/// Random-weight MoE decoder implementing [`CausalLM`].
#[derive(Debug)]
pub struct TinyMoeModel {
    config: SessionConfig,
    /// Token embeddings.
    pub embed_tokens: nn::Embedding,
    /// Decoder layers.
    pub layers: Vec<TinyDecoderLayer>,
    /// Final layer norm.
    pub norm: nn::RmsNorm,
    /// Language model head.
    pub lm_head: nn::Linear,
    last_dispatch: Vec<DispatchStats>,
}

impl TinyMoeModel {
    /// Build a model with random weights.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let embed_tokens =
            nn::Embedding::new(config.vocab_size as i32, config.hidden_size as i32)?;
        let layers = (0..config.num_layers)
            .map(|i| TinyDecoderLayer::new(&config, i))
            .collect::<Result<Vec<_>>>()?;
        let norm = nn::RmsNormBuilder::new(config.hidden_size as i32)
            .eps(config.rms_norm_eps)
            .build()?;
        let lm_head = nn::LinearBuilder::new(config.hidden_size as i32, config.vocab_size as i32)
            .bias(false)
            .build()?;
        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            last_dispatch: Vec::new(),
        })
    }

    /// Dispatch statistics of every layer for the last forward pass.
    pub fn last_dispatch(&self) -> &[DispatchStats] {
        &self.last_dispatch
    }
}

impl CausalLM for TinyMoeModel {
    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn forward(&mut self, input_ids: &Array, cache: &mut KVCache) -> Result<Array> {
        if cache.num_layers() != self.layers.len() {
            return Err(MlxError::InvariantViolation(format!(
                "cache has {} layers, model has {}",
                cache.num_layers(),
                self.layers.len()
            ))
            .into());
        }
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        self.last_dispatch.clear();
        for (layer_idx, layer) in self.layers.iter_mut().enumerate() {
            let (out, stats) = layer.forward(&hidden, cache, layer_idx)?;
            self.last_dispatch.push(stats);
            hidden = out;
        }
        let hidden = self.norm.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }
}
