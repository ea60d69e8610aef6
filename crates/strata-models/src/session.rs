//! Decode sessions.
//!
//! A [`Session`] owns one model and one [`KVCache`]. Sessions share no
//! mutable state, so independent sessions need no locking; buffers are
//! released when the session (or its cache) is dropped or reset.

use mlx_rs::Array;
use strata_core::SessionConfig;
use strata_mlx::KVCache;
use tracing::{debug, info, warn};

use crate::error::{ModelError, Result};
use crate::generation::{
    token_array, DecodeLoop, GenerationConfig, GenerationOutput, GenerationResponse, StepControl,
};
use crate::traits::CausalLM;

/// One model plus the cache for one conversation.
#[derive(Debug)]
pub struct Session<M: CausalLM> {
    config: SessionConfig,
    model: M,
    cache: KVCache,
}

impl<M: CausalLM> Session<M> {
    /// Validate `config`, check it against the model and allocate the cache.
    pub fn create(config: SessionConfig, model: M) -> Result<Self> {
        config.validate()?;
        let model_config = model.config();
        if model_config.num_layers != config.num_layers
            || model_config.vocab_size != config.vocab_size
        {
            return Err(ModelError::Core(strata_core::StrataError::Config(format!(
                "session expects {} layers / vocab {}, model has {} / {}",
                config.num_layers,
                config.vocab_size,
                model_config.num_layers,
                model_config.vocab_size
            ))));
        }
        let cache = KVCache::for_session(&config)?;
        info!(
            num_layers = config.num_layers,
            cache_kind = ?config.cache.kind,
            sliding_layers = config.sliding_window_layers.len(),
            moe = config.moe.is_some(),
            "session created"
        );
        Ok(Self {
            config,
            model,
            cache,
        })
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The cache.
    pub fn cache(&self) -> &KVCache {
        &self.cache
    }

    /// Absolute position of the next token.
    pub fn offset(&self) -> usize {
        self.cache.rope_offset()
    }

    /// Run `tokens` through the model, advancing every layer's cache.
    ///
    /// Returns `[1, tokens.len(), vocab]` logits.
    pub fn forward(&mut self, tokens: &[u32]) -> Result<Array> {
        if tokens.is_empty() {
            return Err(ModelError::InvalidInput("no tokens to forward".into()));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= self.config.vocab_size) {
            return Err(ModelError::InvalidInput(format!(
                "token {bad} outside vocabulary of {}",
                self.config.vocab_size
            )));
        }
        self.model.forward(&token_array(tokens), &mut self.cache)
    }

    /// Drop all cached history.
    pub fn reset_cache(&mut self) {
        self.cache.reset();
    }

    /// Generate from `prompt`, continuing from any cached history.
    ///
    /// If an error occurs after the model has run, the cache is reset because
    /// layers may have advanced unevenly. Input rejected before any forward
    /// leaves the cache as it was.
    pub fn generate<C>(
        &mut self,
        prompt: &[u32],
        params: GenerationConfig,
        callback: C,
    ) -> Result<GenerationOutput>
    where
        C: FnMut(u32) -> StepControl,
    {
        let mut decode = DecodeLoop::new(params, &self.config.eos_token_ids)?;
        let vocab_size = self.config.vocab_size;
        let (model, cache) = (&mut self.model, &mut self.cache);
        let mut forwarded = false;
        let result = decode.run(
            prompt,
            |ids| {
                check_vocab(ids, vocab_size)?;
                forwarded = true;
                model.forward(ids, cache)
            },
            callback,
        );
        match &result {
            Err(err) if forwarded => {
                warn!(error = %err, "generation failed, resetting cache");
                self.cache.reset();
            }
            Err(err) => debug!(error = %err, "generation rejected before forward"),
            Ok(_) => {}
        }
        result
    }

    /// [`Self::generate`] without a callback, wrapped as a JSON-ready reply.
    pub fn generate_response(&mut self, prompt: &[u32], params: GenerationConfig) -> GenerationResponse {
        let result = self.generate(prompt, params, |_| StepControl::Continue);
        GenerationResponse::from_result(&result)
    }
}

fn check_vocab(ids: &Array, vocab_size: usize) -> Result<()> {
    ids.eval()?;
    if let Some(&bad) = ids
        .as_slice::<i32>()
        .iter()
        .find(|&&t| t < 0 || t as usize >= vocab_size)
    {
        return Err(ModelError::InvalidInput(format!(
            "token {bad} outside vocabulary of {vocab_size}"
        )));
    }
    Ok(())
}
