//! Token sampling and the prefill/decode loop.
//!
//! Sampling follows mlx_lm:
//! 1. Repetition penalty on raw logits over a recent-context window
//! 2. Log-softmax: `logprobs = logits - logsumexp(logits)`
//! 3. Top-k, top-p and min-p filters on log probabilities
//! 4. `categorical(logprobs * (1 / temperature))`
//!
//! A temperature of zero selects greedy argmax decoding.
//!
//! The decode loop is a three-state machine:
//!
//! ```text
//! Prefill --(prompt forward)--> Decode --(budget | eos | callback)--> Stopped
//! ```
//!
//! Degenerate logits (NaN, +inf, or nothing finite) are not an error: that
//! single step falls back to a host-side argmax and a warning is logged.

use std::time::Instant;

use mlx_rs::{
    error::Exception,
    ops::{
        argpartition_axis, argsort_axis, exp,
        indexing::{argmax, put_along_axis, take_along_axis, IndexOp},
        logsumexp_axis, which, zeros_like,
    },
    random::{categorical, seed as mlx_seed},
    Array,
};
use serde::{Deserialize, Serialize};
use strata_core::StrataError;
use strata_mlx::MlxError;
use tracing::{debug, info, warn};

use crate::error::{ModelError, Result};

/// Configuration for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of new tokens to generate.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Sampling temperature; `0.0` is greedy decoding.
    #[serde(default)]
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled).
    #[serde(default)]
    pub top_k: usize,
    /// Top-p (nucleus) sampling parameter (1.0 = disabled).
    #[serde(default = "default_one")]
    pub top_p: f32,
    /// Min-p threshold relative to the top token probability (0.0 = disabled).
    #[serde(default)]
    pub min_p: f32,
    /// Repetition penalty (1.0 = disabled).
    /// Values > 1.0 discourage repetition, < 1.0 encourage it.
    #[serde(default = "default_one")]
    pub repetition_penalty: f32,
    /// Number of most recent tokens the repetition penalty looks at.
    #[serde(default = "default_repetition_context")]
    pub repetition_context_size: usize,
    /// Extra token IDs that end generation, on top of the model's EOS tokens.
    #[serde(default)]
    pub stop_tokens: Vec<u32>,
    /// Random seed for reproducible sampling.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_new_tokens() -> usize {
    256
}

fn default_one() -> f32 {
    1.0
}

fn default_repetition_context() -> usize {
    20
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            repetition_penalty: 1.0,
            repetition_context_size: default_repetition_context(),
            stop_tokens: vec![],
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a greedy decoding config.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Default::default()
        }
    }

    /// Create a sampling config with temperature.
    pub fn sampling(max_new_tokens: usize, temperature: f32) -> Self {
        Self {
            max_new_tokens,
            temperature,
            top_p: 0.95,
            ..Default::default()
        }
    }

    /// Set top-k sampling.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p (nucleus) sampling.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set min-p sampling threshold.
    ///
    /// Tokens are kept if their probability >= min_p * top_token_probability.
    pub fn with_min_p(mut self, min_p: f32) -> Self {
        self.min_p = min_p;
        self
    }

    /// Set repetition penalty and the context it applies to.
    pub fn with_repetition_penalty(mut self, penalty: f32, context_size: usize) -> Self {
        self.repetition_penalty = penalty;
        self.repetition_context_size = context_size;
        self
    }

    /// Set stop tokens.
    pub fn with_stop_tokens(mut self, tokens: Vec<u32>) -> Self {
        self.stop_tokens = tokens;
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether this config decodes greedily.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Validate the configuration.
    pub fn validate(&self) -> strata_core::Result<()> {
        if self.max_new_tokens == 0 {
            return Err(StrataError::Config("max_new_tokens must be positive".into()));
        }
        if !(self.temperature >= 0.0) || !self.temperature.is_finite() {
            return Err(StrataError::Config(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(StrataError::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(0.0..1.0).contains(&self.min_p) {
            return Err(StrataError::Config(format!(
                "min_p must be in [0, 1), got {}",
                self.min_p
            )));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(StrataError::Config(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Sampler for token generation.
pub struct Sampler {
    config: GenerationConfig,
    /// Cached -inf scalar for filter operations
    neg_inf: Array,
    /// Steps that fell back to greedy because the distribution was degenerate.
    fallbacks: usize,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("config", &self.config)
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

impl Sampler {
    /// Create a new sampler, seeding the MLX generator if a seed is set.
    pub fn new(config: GenerationConfig) -> Self {
        if let Some(seed) = config.seed {
            let _ = mlx_seed(seed);
        }
        Self {
            config,
            neg_inf: Array::from_f32(f32::NEG_INFINITY),
            fallbacks: 0,
        }
    }

    /// Get the generation config.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Number of steps recovered with the greedy fallback.
    pub fn fallbacks(&self) -> usize {
        self.fallbacks
    }

    /// Sample the next token from `[vocab]` (or `[1, vocab]`) logits.
    ///
    /// `history` is the prompt plus everything generated so far.
    pub fn sample(&mut self, logits: &Array, history: &[u32]) -> Result<u32> {
        let logits = logits.as_type::<f32>()?.reshape(&[-1])?;
        if logits.size() == 0 {
            return Err(StrataError::Sampling("empty logits".into()).into());
        }
        let logits = if self.config.repetition_penalty != 1.0 {
            apply_repetition_penalty(
                &logits,
                history,
                self.config.repetition_penalty,
                self.config.repetition_context_size,
            )?
        } else {
            logits
        };

        logits.eval()?;
        let host = logits.as_slice::<f32>();
        if let Some(reason) = degenerate(host) {
            self.fallbacks += 1;
            let token = host_argmax(host);
            warn!(reason, token, "degenerate logits, falling back to greedy");
            return Ok(token);
        }

        if self.config.is_greedy() {
            return Ok(argmax(&logits, None)?.item::<u32>());
        }

        let vocab_size = logits.dim(0);
        let log_probs = logits_to_log_probs(&logits.reshape(&[1, vocab_size])?)?;
        let log_probs = self.apply_filters(&log_probs, vocab_size)?;
        let scaled = log_probs.multiply(Array::from_f32(1.0 / self.config.temperature))?;
        let token = categorical(&scaled, None, None, None)?;
        Ok(token.item::<u32>())
    }

    /// Apply the configured filters to `[1, vocab]` log probabilities.
    fn apply_filters(&self, log_probs: &Array, vocab_size: i32) -> Result<Array> {
        let mut result = log_probs.clone();
        if self.config.top_k > 0 && (self.config.top_k as i32) < vocab_size {
            result = self.top_k_filter(&result)?;
        }
        if self.config.top_p < 1.0 {
            result = self.top_p_filter(&result, vocab_size)?;
        }
        if self.config.min_p > 0.0 {
            result = self.min_p_filter(&result, vocab_size)?;
        }
        Ok(result)
    }

    /// Mask everything outside the `top_k` largest entries.
    fn top_k_filter(&self, log_probs: &Array) -> std::result::Result<Array, Exception> {
        let k = self.config.top_k as i32;
        let neg = log_probs.negative()?;
        let mask_idx = argpartition_axis(&neg, k - 1, -1)?.index((.., k..));
        put_along_axis(log_probs, &mask_idx, &self.neg_inf, -1)
    }

    /// Keep the smallest set of tokens whose cumulative probability reaches `top_p`.
    fn top_p_filter(&self, log_probs: &Array, vocab_size: i32) -> std::result::Result<Array, Exception> {
        let probs = exp(log_probs)?;
        let sorted_indices = argsort_axis(log_probs, -1)?;
        let sorted_probs = take_along_axis(&probs, &sorted_indices, -1)?;
        let cumulative = sorted_probs.cumsum(-1, None, None)?;

        let inverse = inverse_permutation(&sorted_indices, vocab_size)?;
        let cumulative = take_along_axis(&cumulative, &inverse, -1)?;

        let threshold = Array::from_f32(1.0 - self.config.top_p);
        let keep = cumulative.gt(&threshold)?;
        which(&keep, log_probs, &self.neg_inf)
    }

    /// Drop tokens less likely than `min_p` times the top token.
    fn min_p_filter(&self, log_probs: &Array, vocab_size: i32) -> std::result::Result<Array, Exception> {
        let sorted_indices = argsort_axis(&log_probs.negative()?, -1)?;
        let sorted = take_along_axis(log_probs, &sorted_indices, -1)?;

        let top = sorted.index((.., 0..1));
        let threshold = top.add(Array::from_f32(self.config.min_p.ln()))?;
        let remove = sorted.lt(&threshold)?;
        let filtered = which(&remove, &self.neg_inf, &sorted)?;

        let inverse = inverse_permutation(&sorted_indices, vocab_size)?;
        take_along_axis(&filtered, &inverse, -1)
    }
}

fn inverse_permutation(sorted_indices: &Array, vocab_size: i32) -> std::result::Result<Array, Exception> {
    let vocab_range = Array::from_iter(0..vocab_size, &[1, vocab_size]);
    put_along_axis(&zeros_like(sorted_indices)?, sorted_indices, &vocab_range, -1)
}

/// Convert logits to log probabilities (log-softmax).
fn logits_to_log_probs(logits: &Array) -> std::result::Result<Array, Exception> {
    let lse = logsumexp_axis(logits, -1, true)?;
    logits.subtract(&lse)
}

/// Repetition penalty over the most recent `context_size` tokens.
///
/// Positive logits are divided by the penalty, negative ones multiplied.
fn apply_repetition_penalty(
    logits: &Array,
    history: &[u32],
    penalty: f32,
    context_size: usize,
) -> std::result::Result<Array, Exception> {
    let vocab_size = logits.dim(0) as u32;
    let mut recent: Vec<i32> = Vec::with_capacity(context_size.min(history.len()));
    for &token in history.iter().rev().take(context_size) {
        let token = token as i32;
        if (token as u32) < vocab_size && !recent.contains(&token) {
            recent.push(token);
        }
    }
    if recent.is_empty() {
        return Ok(logits.clone());
    }

    let indices = Array::from_slice(&recent, &[recent.len() as i32]);
    let selected = take_along_axis(logits, &indices, -1)?;
    let is_negative = selected.lt(&Array::from_f32(0.0))?;
    let penalized = which(
        &is_negative,
        selected.multiply(Array::from_f32(penalty))?,
        selected.multiply(Array::from_f32(1.0 / penalty))?,
    )?;
    put_along_axis(logits, &indices, &penalized, -1)
}

/// Why a distribution cannot be sampled, if it cannot.
fn degenerate(logits: &[f32]) -> Option<&'static str> {
    if logits.iter().any(|v| v.is_nan()) {
        Some("nan logits")
    } else if logits.iter().any(|&v| v == f32::INFINITY) {
        Some("infinite logits")
    } else if !logits.iter().any(|v| v.is_finite()) {
        Some("no finite logits")
    } else {
        None
    }
}

/// Host argmax ignoring NaN; ties go to the lower index.
fn host_argmax(logits: &[f32]) -> u32 {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map_or(0, |(i, _)| i as u32)
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The token budget was exhausted.
    MaxTokens,
    /// An end-of-sequence or stop token was sampled.
    Eos,
    /// The per-token callback asked to stop.
    Callback,
}

/// Signal returned by the per-token callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    /// Keep decoding.
    Continue,
    /// Stop after this token.
    Stop,
}

/// Decode loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// The prompt has not been processed yet.
    Prefill,
    /// Generating one token per step.
    Decode,
    /// Terminal.
    Stopped(StopReason),
}

/// Output from text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Generated token IDs, excluding the prompt and any EOS token.
    pub tokens: Vec<u32>,
    /// Number of generated tokens.
    pub token_count: usize,
    /// Generated tokens per second over the whole call.
    pub tokens_per_second: f64,
    /// Number of prompt tokens consumed by prefill.
    pub prompt_tokens: usize,
    /// Why the loop stopped.
    pub stop_reason: StopReason,
    /// Time spent in the prefill forward pass.
    pub prefill_seconds: f64,
}

/// JSON reply for host bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    /// Whether generation completed.
    pub success: bool,
    /// Generated token IDs.
    pub tokens: Vec<u32>,
    /// Number of generated tokens.
    pub token_count: usize,
    /// Generated tokens per second.
    pub tokens_per_second: f64,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationResponse {
    /// Build the reply for a generation result.
    pub fn from_result(result: &Result<GenerationOutput>) -> Self {
        match result {
            Ok(output) => Self {
                success: true,
                tokens: output.tokens.clone(),
                token_count: output.token_count,
                tokens_per_second: output.tokens_per_second,
                error: None,
            },
            Err(err) => Self {
                success: false,
                tokens: vec![],
                token_count: 0,
                tokens_per_second: 0.0,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Prefill/decode state machine over a forward function.
///
/// The forward function takes `[1, seq_len]` token IDs, advances whatever
/// cache it closes over by `seq_len`, and returns `[1, seq_len, vocab]` logits.
#[derive(Debug)]
pub struct DecodeLoop {
    config: GenerationConfig,
    sampler: Sampler,
    stop_tokens: Vec<u32>,
    phase: DecodePhase,
}

impl DecodeLoop {
    /// Create a loop; `eos_tokens` are merged with the config's stop tokens.
    pub fn new(config: GenerationConfig, eos_tokens: &[u32]) -> Result<Self> {
        config.validate()?;
        let mut stop_tokens = config.stop_tokens.clone();
        stop_tokens.extend_from_slice(eos_tokens);
        stop_tokens.sort_unstable();
        stop_tokens.dedup();
        Ok(Self {
            sampler: Sampler::new(config.clone()),
            config,
            stop_tokens,
            phase: DecodePhase::Prefill,
        })
    }

    /// Current state.
    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    /// Sampler, for inspecting fallback counts.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    fn is_stop_token(&self, token: u32) -> bool {
        self.stop_tokens.binary_search(&token).is_ok()
    }

    /// Run prefill and decode until a stop condition.
    ///
    /// `callback` is consulted after every generated token.
    pub fn run<F, C>(&mut self, prompt: &[u32], mut forward: F, mut callback: C) -> Result<GenerationOutput>
    where
        F: FnMut(&Array) -> Result<Array>,
        C: FnMut(u32) -> StepControl,
    {
        if self.phase != DecodePhase::Prefill {
            return Err(ModelError::InvalidInput(format!(
                "decode loop is in {:?}, expected Prefill",
                self.phase
            )));
        }
        if prompt.is_empty() {
            return Err(ModelError::InvalidInput("prompt is empty".into()));
        }

        let start = Instant::now();
        let input = token_array(prompt);
        let mut logits = last_position(&forward(&input)?)?;
        logits.eval()?;
        let prefill_seconds = start.elapsed().as_secs_f64();
        debug!(prompt_tokens = prompt.len(), prefill_seconds, "prefill complete");
        self.phase = DecodePhase::Decode;

        let mut history = prompt.to_vec();
        let mut tokens = Vec::with_capacity(self.config.max_new_tokens);
        let stop_reason = loop {
            let token = self.sampler.sample(&logits, &history)?;
            if self.is_stop_token(token) {
                break StopReason::Eos;
            }
            tokens.push(token);
            history.push(token);

            if callback(token) == StepControl::Stop {
                break StopReason::Callback;
            }
            if tokens.len() >= self.config.max_new_tokens {
                break StopReason::MaxTokens;
            }

            logits = last_position(&forward(&token_array(&[token]))?)?;
        };
        self.phase = DecodePhase::Stopped(stop_reason);

        let elapsed = start.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 {
            tokens.len() as f64 / elapsed
        } else {
            0.0
        };
        info!(
            tokens = tokens.len(),
            tokens_per_second,
            ?stop_reason,
            "generation finished"
        );

        Ok(GenerationOutput {
            token_count: tokens.len(),
            tokens,
            tokens_per_second,
            prompt_tokens: prompt.len(),
            stop_reason,
            prefill_seconds,
        })
    }
}

/// `[1, len]` int32 input IDs.
pub fn token_array(tokens: &[u32]) -> Array {
    let ids: Vec<i32> = tokens.iter().map(|&t| t as i32).collect();
    Array::from_slice(&ids, &[1, ids.len() as i32])
}

/// Logits of the last position of `[1, seq_len, vocab]` (or `[seq_len, vocab]`).
fn last_position(logits: &Array) -> Result<Array> {
    match logits.ndim() {
        3 => Ok(logits.index((0, logits.dim(1) - 1, ..))),
        2 => Ok(logits.index((logits.dim(0) - 1, ..))),
        rank => Err(MlxError::InvariantViolation(format!(
            "forward must return [batch, seq, vocab] logits, got rank {rank}"
        ))
        .into()),
    }
}
