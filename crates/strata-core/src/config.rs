//! Configuration types for strata.
//!
//! Every value here is fixed for the lifetime of a session. Configs are
//! validated before any buffer is allocated so that a malformed parameter
//! surfaces as [`StrataError::Config`] instead of a failure mid-decode.

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bit widths supported by the quantized cache.
pub const SUPPORTED_CACHE_BITS: [u8; 6] = [2, 3, 4, 5, 6, 8];

/// Which key/value cache layout a layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Keep every past token, growing in fixed steps.
    #[default]
    Standard,
    /// Fixed window plus permanently retained sink tokens.
    Rotating,
    /// Group-quantized storage, dequantized on read.
    Quantized,
}

/// Key/value cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache layout.
    #[serde(default)]
    pub kind: CacheKind,

    /// Growth step in tokens.
    #[serde(default = "default_cache_step")]
    pub step: usize,

    /// Hard cap on allocated slots; growth past it is an allocation failure.
    #[serde(default)]
    pub max_capacity: Option<usize>,

    /// Live window size for the rotating layout.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Number of sink tokens the rotating layout never evicts.
    #[serde(default = "default_keep")]
    pub keep: usize,

    /// Bit width for the quantized layout.
    #[serde(default = "default_bits")]
    pub bits: u8,

    /// Quantization group size along the head dimension.
    #[serde(default = "default_group_size")]
    pub group_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Standard,
            step: default_cache_step(),
            max_capacity: None,
            window: default_window(),
            keep: default_keep(),
            bits: default_bits(),
            group_size: default_group_size(),
        }
    }
}

impl CacheConfig {
    /// Standard growing cache.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Rotating cache with `window` live slots and `keep` sink slots.
    pub fn rotating(window: usize, keep: usize) -> Self {
        Self {
            kind: CacheKind::Rotating,
            window,
            keep,
            ..Self::default()
        }
    }

    /// Quantized cache.
    pub fn quantized(bits: u8, group_size: usize) -> Self {
        Self {
            kind: CacheKind::Quantized,
            bits,
            group_size,
            ..Self::default()
        }
    }

    /// Set the growth step.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Cap the number of allocated slots.
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    /// Total slots of a rotating cache (window plus sinks).
    pub fn rotating_capacity(&self) -> usize {
        self.window + self.keep
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(StrataError::Config("cache step must be positive".into()));
        }
        if self.max_capacity == Some(0) {
            return Err(StrataError::Config("max_capacity must be positive".into()));
        }
        match self.kind {
            CacheKind::Standard => {}
            CacheKind::Rotating => {
                if self.window == 0 {
                    return Err(StrataError::Config(
                        "rotating cache window must be positive".into(),
                    ));
                }
            }
            CacheKind::Quantized => {
                if !SUPPORTED_CACHE_BITS.contains(&self.bits) {
                    return Err(StrataError::Config(format!(
                        "unsupported cache bit width {} (expected one of {:?})",
                        self.bits, SUPPORTED_CACHE_BITS
                    )));
                }
                if self.group_size == 0 {
                    return Err(StrataError::Config("group_size must be positive".into()));
                }
            }
        }
        Ok(())
    }
}

/// Frequency scaling applied on top of the base rotary frequencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RopeScaling {
    /// Positions divided by `factor`.
    Linear {
        /// Position scale factor.
        factor: f32,
    },
    /// Wavelength-smoothed scaling.
    Llama3 {
        /// Scale factor for low frequencies.
        factor: f32,
        /// Low frequency boundary factor.
        #[serde(default = "default_low_freq_factor")]
        low_freq_factor: f32,
        /// High frequency boundary factor.
        #[serde(default = "default_high_freq_factor")]
        high_freq_factor: f32,
        /// Context length the base model was trained on.
        #[serde(default = "default_llama3_original_max")]
        original_max_position_embeddings: usize,
    },
    /// NTK-by-parts correction with attention magnitude scaling.
    Yarn {
        /// Context extension factor.
        factor: f32,
        /// Context length the base model was trained on.
        #[serde(default = "default_yarn_original_max")]
        original_max_position_embeddings: usize,
        /// Fast correction boundary (rotations).
        #[serde(default = "default_beta_fast")]
        beta_fast: f32,
        /// Slow correction boundary (rotations).
        #[serde(default = "default_beta_slow")]
        beta_slow: f32,
        /// Magnitude scale numerator coefficient.
        #[serde(default = "default_one_f32")]
        mscale: f32,
        /// Magnitude scale denominator coefficient.
        #[serde(default)]
        mscale_all_dim: f32,
    },
    /// Short/long per-frequency rescale arrays.
    LongRope {
        /// Factors used while the sequence fits the trained context.
        short_factor: Vec<f32>,
        /// Factors used once the sequence exceeds the trained context.
        long_factor: Vec<f32>,
        /// Context length the base model was trained on.
        original_max_position_embeddings: usize,
        /// Magnitude scale for the short branch.
        #[serde(default)]
        short_mscale: Option<f32>,
        /// Magnitude scale for the long branch.
        #[serde(default)]
        long_mscale: Option<f32>,
    },
}

/// Rotary positional encoding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeConfig {
    /// Number of leading features rotated (the rest pass through).
    pub dims: usize,

    /// Base theta.
    #[serde(default = "default_rope_base")]
    pub base: f32,

    /// Rotate interleaved pairs instead of the two halves.
    #[serde(default)]
    pub traditional: bool,

    /// Maximum context the model supports.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Optional frequency scaling.
    #[serde(default)]
    pub scaling: Option<RopeScaling>,
}

impl RopeConfig {
    /// Unscaled RoPE over `dims` features.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            base: default_rope_base(),
            traditional: false,
            max_position_embeddings: default_max_position_embeddings(),
            scaling: None,
        }
    }

    /// Set base theta.
    pub fn with_base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }

    /// Set frequency scaling.
    pub fn with_scaling(mut self, scaling: RopeScaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// Set the maximum supported context.
    pub fn with_max_position_embeddings(mut self, max: usize) -> Self {
        self.max_position_embeddings = max;
        self
    }

    /// Use interleaved pair rotation.
    pub fn with_traditional(mut self, traditional: bool) -> Self {
        self.traditional = traditional;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dims == 0 || self.dims % 2 != 0 {
            return Err(StrataError::Config(format!(
                "rope dims must be a positive even number, got {}",
                self.dims
            )));
        }
        if !(self.base > 0.0) {
            return Err(StrataError::Config("rope base must be positive".into()));
        }
        match &self.scaling {
            None => {}
            Some(RopeScaling::Linear { factor }) => check_factor(*factor)?,
            Some(RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            }) => {
                check_factor(*factor)?;
                if high_freq_factor <= low_freq_factor {
                    return Err(StrataError::Config(
                        "llama3 high_freq_factor must exceed low_freq_factor".into(),
                    ));
                }
                if *original_max_position_embeddings == 0 {
                    return Err(StrataError::Config(
                        "original_max_position_embeddings must be positive".into(),
                    ));
                }
            }
            Some(RopeScaling::Yarn {
                factor,
                original_max_position_embeddings,
                beta_fast,
                beta_slow,
                ..
            }) => {
                check_factor(*factor)?;
                if beta_fast <= beta_slow {
                    return Err(StrataError::Config(
                        "yarn beta_fast must exceed beta_slow".into(),
                    ));
                }
                if *original_max_position_embeddings == 0 {
                    return Err(StrataError::Config(
                        "original_max_position_embeddings must be positive".into(),
                    ));
                }
            }
            Some(RopeScaling::LongRope {
                short_factor,
                long_factor,
                original_max_position_embeddings,
                ..
            }) => {
                let half = self.dims / 2;
                if short_factor.len() != half || long_factor.len() != half {
                    return Err(StrataError::Config(format!(
                        "longrope factor arrays must have {} entries, got {} and {}",
                        half,
                        short_factor.len(),
                        long_factor.len()
                    )));
                }
                if short_factor.iter().chain(long_factor).any(|f| !(*f > 0.0)) {
                    return Err(StrataError::Config(
                        "longrope factors must be positive".into(),
                    ));
                }
                if *original_max_position_embeddings == 0 {
                    return Err(StrataError::Config(
                        "original_max_position_embeddings must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_factor(factor: f32) -> Result<()> {
    if factor > 0.0 && factor.is_finite() {
        Ok(())
    } else {
        Err(StrataError::Config(format!(
            "rope scaling factor must be positive, got {factor}"
        )))
    }
}

/// Expert feed-forward activation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MoeActivation {
    /// `silu(gate) * up`.
    #[default]
    Swiglu,
    /// Clipped gate with a scaled sigmoid, used by sink-attention models.
    ClippedSwiglu {
        /// Sigmoid coefficient.
        #[serde(default = "default_swiglu_alpha")]
        alpha: f32,
        /// Clip limit.
        #[serde(default = "default_swiglu_limit")]
        limit: f32,
    },
}

impl MoeActivation {
    /// Clipped activation with the reference coefficients.
    pub fn clipped() -> Self {
        MoeActivation::ClippedSwiglu {
            alpha: default_swiglu_alpha(),
            limit: default_swiglu_limit(),
        }
    }
}

/// Mixture-of-Experts routing and dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Number of experts.
    pub num_experts: usize,

    /// Experts selected per token.
    pub top_k: usize,

    /// Token count at or above which dispatch sorts by expert.
    #[serde(default = "default_sort_threshold")]
    pub sort_threshold: usize,

    /// Expert activation.
    #[serde(default)]
    pub activation: MoeActivation,
}

impl MoeConfig {
    /// Create a MoE config.
    pub fn new(num_experts: usize, top_k: usize) -> Self {
        Self {
            num_experts,
            top_k,
            sort_threshold: default_sort_threshold(),
            activation: MoeActivation::default(),
        }
    }

    /// Set the sort threshold.
    pub fn with_sort_threshold(mut self, threshold: usize) -> Self {
        self.sort_threshold = threshold;
        self
    }

    /// Set the activation.
    pub fn with_activation(mut self, activation: MoeActivation) -> Self {
        self.activation = activation;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_experts == 0 {
            return Err(StrataError::Config("num_experts must be positive".into()));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(StrataError::Config(format!(
                "top_k must be in [1, {}], got {}",
                self.num_experts, self.top_k
            )));
        }
        if let MoeActivation::ClippedSwiglu { alpha, limit } = self.activation {
            if !(alpha > 0.0) || !(limit > 0.0) {
                return Err(StrataError::Config(
                    "clipped swiglu alpha and limit must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Everything a decode session needs, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Hidden size.
    pub hidden_size: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Feed-forward intermediate size (per expert for MoE layers).
    pub intermediate_size: usize,

    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,

    /// End-of-sequence tokens.
    #[serde(default)]
    pub eos_token_ids: Vec<u32>,

    /// Window for local-attention layers.
    #[serde(default)]
    pub sliding_window: Option<usize>,

    /// Layers that use local attention and therefore a rotating cache.
    #[serde(default)]
    pub sliding_window_layers: Vec<usize>,

    /// Whether attention carries learned per-head sink logits.
    #[serde(default)]
    pub attention_sinks: bool,

    /// Cache configuration for global-attention layers.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Rotary encoding.
    pub rope: RopeConfig,

    /// MoE configuration, if the MLP stage is sparse.
    #[serde(default)]
    pub moe: Option<MoeConfig>,
}

impl SessionConfig {
    /// Cache configuration for a given layer.
    ///
    /// Local-attention layers get a rotating cache sized to the model's window,
    /// keeping the configured sinks.
    pub fn cache_for_layer(&self, layer: usize) -> CacheConfig {
        match self.sliding_window {
            Some(window) if self.sliding_window_layers.contains(&layer) => CacheConfig {
                kind: CacheKind::Rotating,
                window,
                keep: if self.cache.kind == CacheKind::Rotating {
                    self.cache.keep
                } else {
                    0
                },
                ..self.cache.clone()
            },
            _ => self.cache.clone(),
        }
    }

    /// Whether `token` ends generation.
    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_layers", self.num_layers),
            ("hidden_size", self.hidden_size),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("vocab_size", self.vocab_size),
            ("intermediate_size", self.intermediate_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StrataError::Config(format!("{name} must be positive")));
            }
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(StrataError::Config(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.rope.dims > self.head_dim {
            return Err(StrataError::Config(format!(
                "rope dims ({}) exceed head_dim ({})",
                self.rope.dims, self.head_dim
            )));
        }
        if let Some(&layer) = self
            .sliding_window_layers
            .iter()
            .find(|&&l| l >= self.num_layers)
        {
            return Err(StrataError::Config(format!(
                "sliding window layer {layer} out of range for {} layers",
                self.num_layers
            )));
        }
        if !self.sliding_window_layers.is_empty() && self.sliding_window.is_none() {
            return Err(StrataError::Config(
                "sliding_window_layers set without sliding_window".into(),
            ));
        }
        self.cache.validate()?;
        for layer in &self.sliding_window_layers {
            self.cache_for_layer(*layer).validate()?;
        }
        self.rope.validate()?;
        if let Some(moe) = &self.moe {
            moe.validate()?;
        }
        Ok(())
    }

    /// Build a session config from a Hugging Face `config.json` value.
    ///
    /// The cache section is not part of the model config and starts at its
    /// defaults; callers override it before validation.
    pub fn from_hf_config(value: &Value) -> Result<Self> {
        let hidden_size = require_usize(value, "hidden_size")?;
        let num_layers = require_usize(value, "num_hidden_layers")?;
        let num_heads = require_usize(value, "num_attention_heads")?;
        let num_kv_heads = get_usize(value, "num_key_value_heads").unwrap_or(num_heads);
        if num_heads == 0 {
            return Err(StrataError::Config("num_attention_heads must be positive".into()));
        }
        let head_dim = get_usize(value, "head_dim").unwrap_or(hidden_size / num_heads);
        let vocab_size = require_usize(value, "vocab_size")?;

        let num_experts =
            get_usize(value, "num_local_experts").or_else(|| get_usize(value, "num_experts"));
        let intermediate_size = match num_experts {
            Some(_) => get_usize(value, "moe_intermediate_size")
                .or_else(|| get_usize(value, "intermediate_size")),
            None => get_usize(value, "intermediate_size"),
        }
        .ok_or_else(|| StrataError::Config("missing intermediate_size".into()))?;

        let model_type = value
            .get("model_type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let partial_rotary = get_f32(value, "partial_rotary_factor").unwrap_or(1.0);
        let dims = ((head_dim as f32) * partial_rotary) as usize;
        let rope = RopeConfig {
            dims,
            base: get_f32(value, "rope_theta").unwrap_or_else(default_rope_base),
            traditional: false,
            max_position_embeddings: get_usize(value, "max_position_embeddings")
                .unwrap_or_else(default_max_position_embeddings),
            scaling: parse_rope_scaling(value)?,
        };

        let moe = match num_experts {
            Some(num_experts) => {
                let top_k = get_usize(value, "num_experts_per_tok")
                    .or_else(|| get_usize(value, "experts_per_token"))
                    .ok_or_else(|| StrataError::Config("missing num_experts_per_tok".into()))?;
                let activation = match get_f32(value, "swiglu_limit") {
                    Some(limit) => MoeActivation::ClippedSwiglu {
                        alpha: default_swiglu_alpha(),
                        limit,
                    },
                    None if model_type == "gpt_oss" => MoeActivation::clipped(),
                    None => MoeActivation::Swiglu,
                };
                Some(MoeConfig {
                    num_experts,
                    top_k,
                    sort_threshold: default_sort_threshold(),
                    activation,
                })
            }
            None => None,
        };

        let sliding_window = get_usize(value, "sliding_window");
        let sliding_window_layers = match value.get("layer_types").and_then(Value::as_array) {
            Some(types) if sliding_window.is_some() => types
                .iter()
                .enumerate()
                .filter(|(_, t)| t.as_str() == Some("sliding_attention"))
                .map(|(i, _)| i)
                .collect(),
            _ => Vec::new(),
        };

        let eos_token_ids = match value.get("eos_token_id") {
            Some(Value::Number(n)) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(Value::as_u64)
                .map(|id| id as u32)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            num_layers,
            hidden_size,
            num_heads,
            num_kv_heads,
            head_dim,
            vocab_size,
            intermediate_size,
            rms_norm_eps: get_f32(value, "rms_norm_eps").unwrap_or_else(default_rms_norm_eps),
            eos_token_ids,
            sliding_window,
            sliding_window_layers,
            attention_sinks: model_type == "gpt_oss",
            cache: CacheConfig::default(),
            rope,
            moe,
        })
    }
}

fn parse_rope_scaling(value: &Value) -> Result<Option<RopeScaling>> {
    let scaling = match value.get("rope_scaling") {
        Some(Value::Object(map)) => map,
        _ => return Ok(None),
    };
    let scaling = Value::Object(scaling.clone());
    let kind = scaling
        .get("rope_type")
        .or_else(|| scaling.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("default");

    let factor = || {
        get_f32(&scaling, "factor")
            .ok_or_else(|| StrataError::Config(format!("rope_scaling `{kind}` requires factor")))
    };
    let original_max = |fallback: usize| {
        get_usize(&scaling, "original_max_position_embeddings")
            .or_else(|| get_usize(value, "original_max_position_embeddings"))
            .unwrap_or(fallback)
    };

    let parsed = match kind {
        "default" => None,
        "linear" => Some(RopeScaling::Linear { factor: factor()? }),
        "llama3" => Some(RopeScaling::Llama3 {
            factor: factor()?,
            low_freq_factor: get_f32(&scaling, "low_freq_factor")
                .unwrap_or_else(default_low_freq_factor),
            high_freq_factor: get_f32(&scaling, "high_freq_factor")
                .unwrap_or_else(default_high_freq_factor),
            original_max_position_embeddings: original_max(default_llama3_original_max()),
        }),
        "yarn" => Some(RopeScaling::Yarn {
            factor: factor()?,
            original_max_position_embeddings: original_max(default_yarn_original_max()),
            beta_fast: get_f32(&scaling, "beta_fast").unwrap_or_else(default_beta_fast),
            beta_slow: get_f32(&scaling, "beta_slow").unwrap_or_else(default_beta_slow),
            mscale: get_f32(&scaling, "mscale").unwrap_or(1.0),
            mscale_all_dim: get_f32(&scaling, "mscale_all_dim").unwrap_or(0.0),
        }),
        "longrope" | "su" => {
            let factors = |key: &str| -> Result<Vec<f32>> {
                scaling
                    .get(key)
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(Value::as_f64).map(|f| f as f32).collect())
                    .ok_or_else(|| StrataError::Config(format!("longrope requires {key}")))
            };
            Some(RopeScaling::LongRope {
                short_factor: factors("short_factor")?,
                long_factor: factors("long_factor")?,
                original_max_position_embeddings: get_usize(
                    &scaling,
                    "original_max_position_embeddings",
                )
                .or_else(|| get_usize(value, "original_max_position_embeddings"))
                .ok_or_else(|| {
                    StrataError::Config(
                        "longrope requires original_max_position_embeddings".into(),
                    )
                })?,
                short_mscale: get_f32(&scaling, "short_mscale"),
                long_mscale: get_f32(&scaling, "long_mscale"),
            })
        }
        other => {
            return Err(StrataError::Config(format!(
                "unsupported rope_scaling type `{other}`"
            )))
        }
    };
    Ok(parsed)
}

fn get_usize(value: &Value, key: &str) -> Option<usize> {
    value.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn require_usize(value: &Value, key: &str) -> Result<usize> {
    get_usize(value, key).ok_or_else(|| StrataError::Config(format!("missing {key}")))
}

fn get_f32(value: &Value, key: &str) -> Option<f32> {
    value.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

fn default_cache_step() -> usize {
    256
}

fn default_window() -> usize {
    4096
}

fn default_keep() -> usize {
    4
}

fn default_bits() -> u8 {
    8
}

fn default_group_size() -> usize {
    64
}

fn default_rope_base() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_low_freq_factor() -> f32 {
    1.0
}

fn default_high_freq_factor() -> f32 {
    4.0
}

fn default_llama3_original_max() -> usize {
    8192
}

fn default_yarn_original_max() -> usize {
    4096
}

fn default_beta_fast() -> f32 {
    32.0
}

fn default_beta_slow() -> f32 {
    1.0
}

fn default_one_f32() -> f32 {
    1.0
}

fn default_swiglu_alpha() -> f32 {
    1.702
}

fn default_swiglu_limit() -> f32 {
    7.0
}

fn default_sort_threshold() -> usize {
    64
}

fn default_rms_norm_eps() -> f32 {
    1e-6
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_session() -> SessionConfig {
        SessionConfig {
            num_layers: 2,
            hidden_size: 32,
            num_heads: 4,
            num_kv_heads: 2,
            head_dim: 8,
            vocab_size: 16,
            intermediate_size: 64,
            rms_norm_eps: 1e-6,
            eos_token_ids: vec![0],
            sliding_window: None,
            sliding_window_layers: vec![],
            attention_sinks: false,
            cache: CacheConfig::default(),
            rope: RopeConfig::new(8),
            moe: Some(MoeConfig::new(4, 2)),
        }
    }

    #[test]
    fn test_cache_config_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.kind, CacheKind::Standard);
        assert_eq!(config.step, 256);
        assert_eq!(config.bits, 8);
        assert_eq!(config.group_size, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_rejects_zero_step() {
        let config = CacheConfig::standard().with_step(0);
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_cache_config_rejects_bad_bits() {
        let config = CacheConfig::quantized(7, 32);
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
        assert!(CacheConfig::quantized(4, 32).validate().is_ok());
    }

    #[test]
    fn test_rotating_capacity() {
        let config = CacheConfig::rotating(16, 4);
        assert_eq!(config.rotating_capacity(), 20);
        assert!(config.validate().is_ok());
        assert!(CacheConfig::rotating(0, 4).validate().is_err());
    }

    #[test]
    fn test_rope_scaling_serde_tag() {
        let scaling: RopeScaling =
            serde_json::from_value(json!({"type": "yarn", "factor": 4.0})).unwrap();
        match scaling {
            RopeScaling::Yarn {
                factor,
                beta_fast,
                beta_slow,
                original_max_position_embeddings,
                ..
            } => {
                assert_eq!(factor, 4.0);
                assert_eq!(beta_fast, 32.0);
                assert_eq!(beta_slow, 1.0);
                assert_eq!(original_max_position_embeddings, 4096);
            }
            other => panic!("unexpected scaling {other:?}"),
        }
    }

    #[test]
    fn test_rope_config_validation() {
        assert!(RopeConfig::new(7).validate().is_err());
        assert!(RopeConfig::new(0).validate().is_err());
        let bad_longrope = RopeConfig::new(8).with_scaling(RopeScaling::LongRope {
            short_factor: vec![1.0; 3],
            long_factor: vec![1.0; 4],
            original_max_position_embeddings: 4096,
            short_mscale: None,
            long_mscale: None,
        });
        assert!(bad_longrope.validate().is_err());
        let bad_llama3 = RopeConfig::new(8).with_scaling(RopeScaling::Llama3 {
            factor: 8.0,
            low_freq_factor: 4.0,
            high_freq_factor: 1.0,
            original_max_position_embeddings: 8192,
        });
        assert!(bad_llama3.validate().is_err());
    }

    #[test]
    fn test_moe_config_validation() {
        assert!(MoeConfig::new(8, 2).validate().is_ok());
        assert!(MoeConfig::new(8, 0).validate().is_err());
        assert!(MoeConfig::new(2, 3).validate().is_err());
        assert!(MoeConfig::new(0, 1).validate().is_err());
    }

    #[test]
    fn test_session_validation() {
        let config = small_session();
        assert!(config.validate().is_ok());

        let mut bad = small_session();
        bad.num_kv_heads = 3;
        assert!(bad.validate().is_err());

        let mut bad = small_session();
        bad.rope = RopeConfig::new(16);
        assert!(bad.validate().is_err());

        let mut bad = small_session();
        bad.sliding_window_layers = vec![1];
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_cache_for_sliding_layer() {
        let mut config = small_session();
        config.sliding_window = Some(128);
        config.sliding_window_layers = vec![0];
        assert_eq!(config.cache_for_layer(0).kind, CacheKind::Rotating);
        assert_eq!(config.cache_for_layer(0).window, 128);
        assert_eq!(config.cache_for_layer(0).keep, 0);
        assert_eq!(config.cache_for_layer(1).kind, CacheKind::Standard);
    }

    #[test]
    fn test_from_hf_config_llama3() {
        let value = json!({
            "model_type": "llama",
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "vocab_size": 128256,
            "intermediate_size": 14336,
            "rope_theta": 500000.0,
            "max_position_embeddings": 131072,
            "eos_token_id": [128001, 128008, 128009],
            "rope_scaling": {
                "rope_type": "llama3",
                "factor": 8.0,
                "low_freq_factor": 1.0,
                "high_freq_factor": 4.0,
                "original_max_position_embeddings": 8192
            }
        });
        let config = SessionConfig::from_hf_config(&value).unwrap();
        assert_eq!(config.head_dim, 128);
        assert_eq!(config.rope.dims, 128);
        assert_eq!(config.rope.base, 500000.0);
        assert_eq!(config.eos_token_ids, vec![128001, 128008, 128009]);
        assert!(matches!(
            config.rope.scaling,
            Some(RopeScaling::Llama3 { factor, .. }) if factor == 8.0
        ));
        assert!(config.moe.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_hf_config_gpt_oss() {
        let value = json!({
            "model_type": "gpt_oss",
            "hidden_size": 2880,
            "num_hidden_layers": 4,
            "num_attention_heads": 64,
            "num_key_value_heads": 8,
            "head_dim": 64,
            "vocab_size": 201088,
            "intermediate_size": 2880,
            "num_local_experts": 32,
            "num_experts_per_tok": 4,
            "sliding_window": 128,
            "layer_types": ["sliding_attention", "full_attention", "sliding_attention", "full_attention"],
            "swiglu_limit": 7.0,
            "eos_token_id": 200002,
            "rope_theta": 150000.0,
            "rope_scaling": {
                "rope_type": "yarn",
                "factor": 32.0,
                "beta_fast": 32.0,
                "beta_slow": 1.0,
                "original_max_position_embeddings": 4096
            }
        });
        let config = SessionConfig::from_hf_config(&value).unwrap();
        assert!(config.attention_sinks);
        assert_eq!(config.sliding_window_layers, vec![0, 2]);
        assert_eq!(config.eos_token_ids, vec![200002]);
        let moe = config.moe.clone().unwrap();
        assert_eq!(moe.num_experts, 32);
        assert_eq!(moe.top_k, 4);
        assert_eq!(
            moe.activation,
            MoeActivation::ClippedSwiglu {
                alpha: 1.702,
                limit: 7.0
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_hf_config_longrope_uses_top_level_original() {
        let value = json!({
            "hidden_size": 64,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "vocab_size": 100,
            "intermediate_size": 128,
            "original_max_position_embeddings": 4096,
            "max_position_embeddings": 131072,
            "rope_scaling": {
                "type": "su",
                "short_factor": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                "long_factor": [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
            }
        });
        let config = SessionConfig::from_hf_config(&value).unwrap();
        match config.rope.scaling {
            Some(RopeScaling::LongRope {
                original_max_position_embeddings,
                ref long_factor,
                ..
            }) => {
                assert_eq!(original_max_position_embeddings, 4096);
                assert_eq!(long_factor.len(), 8);
            }
            ref other => panic!("unexpected scaling {other:?}"),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_hf_config_missing_field() {
        let value = json!({"hidden_size": 64});
        assert!(matches!(
            SessionConfig::from_hf_config(&value),
            Err(StrataError::Config(_))
        ));
    }

    #[test]
    fn test_from_hf_config_unknown_rope_type() {
        let value = json!({
            "hidden_size": 64,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "vocab_size": 100,
            "intermediate_size": 128,
            "rope_scaling": {"type": "dynamic", "factor": 2.0}
        });
        assert!(SessionConfig::from_hf_config(&value).is_err());
    }
}
