//! Sessions driven end to end, with a stub model and with the MoE reference model.

use mlx_rs::{ops::indexing::IndexOp, Array};
use strata_core::{CacheConfig, MoeConfig, RopeConfig, SessionConfig};
use strata_mlx::KVCache;
use strata_models::architectures::TinyMoeModel;
use strata_models::{
    CausalLM, DecodeLoop, GenerationConfig, ModelError, Session, StepControl, StopReason,
};

const VOCAB: usize = 16;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn stub_config(num_layers: usize) -> SessionConfig {
    SessionConfig {
        num_layers,
        hidden_size: 8,
        num_heads: 2,
        num_kv_heads: 1,
        head_dim: 4,
        vocab_size: VOCAB,
        intermediate_size: 8,
        rms_norm_eps: 1e-6,
        eos_token_ids: vec![],
        sliding_window: None,
        sliding_window_layers: vec![],
        attention_sinks: false,
        cache: CacheConfig::standard().with_step(4),
        rope: RopeConfig::new(4),
        moe: None,
    }
}

/// Always favours `favoured`; writes placeholder keys/values so the cache advances.
struct StubModel {
    config: SessionConfig,
    favoured: usize,
    calls: Vec<i32>,
}

impl StubModel {
    fn new(config: SessionConfig, favoured: usize) -> Self {
        Self {
            config,
            favoured,
            calls: Vec::new(),
        }
    }
}

impl CausalLM for StubModel {
    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn forward(&mut self, input_ids: &Array, cache: &mut KVCache) -> strata_models::Result<Array> {
        let seq_len = input_ids.dim(1);
        self.calls.push(seq_len);
        let kv = Array::zeros::<f32>(&[1, 1, seq_len, 4])?;
        for layer in 0..self.config.num_layers {
            cache.update_and_fetch(layer, &kv, &kv)?;
        }
        let mut row = vec![0.0f32; VOCAB];
        row[self.favoured] = 5.0;
        let data: Vec<f32> = (0..seq_len).flat_map(|_| row.clone()).collect();
        Ok(Array::from_slice(&data, &[1, seq_len, VOCAB as i32]))
    }
}

fn tiny_config() -> SessionConfig {
    SessionConfig {
        num_layers: 2,
        hidden_size: 16,
        num_heads: 4,
        num_kv_heads: 2,
        head_dim: 8,
        vocab_size: 32,
        intermediate_size: 16,
        rms_norm_eps: 1e-5,
        eos_token_ids: vec![],
        sliding_window: Some(4),
        sliding_window_layers: vec![1],
        attention_sinks: true,
        cache: CacheConfig::standard().with_step(8),
        rope: RopeConfig::new(8),
        moe: Some(MoeConfig::new(4, 2).with_sort_threshold(2)),
    }
}

#[test]
fn test_greedy_stub_stops_at_budget() {
    init_tracing();
    let config = stub_config(2);
    let mut session = Session::create(config.clone(), StubModel::new(config, 9)).unwrap();

    let output = session
        .generate(&[1, 2, 3], GenerationConfig::greedy(5), |_| StepControl::Continue)
        .unwrap();

    assert_eq!(output.tokens, vec![9, 9, 9, 9, 9]);
    assert_eq!(output.token_count, 5);
    assert_eq!(output.stop_reason, StopReason::MaxTokens);
    assert_eq!(output.prompt_tokens, 3);
    // Prefill once, then one forward per token except the last sampled one.
    assert_eq!(session.model().calls, vec![3, 1, 1, 1, 1]);
    assert_eq!(session.offset(), 7);
}

#[test]
fn test_decode_loop_with_stub_forward() {
    let config = stub_config(1);
    let mut model = StubModel::new(config.clone(), 9);
    let mut cache = KVCache::for_session(&config).unwrap();
    let mut offsets = Vec::new();

    let mut decode = DecodeLoop::new(GenerationConfig::greedy(5), &[]).unwrap();
    let output = decode
        .run(
            &[1, 2, 3],
            |ids| {
                let logits = model.forward(ids, &mut cache)?;
                offsets.push(cache.offset());
                Ok(logits)
            },
            |_| StepControl::Continue,
        )
        .unwrap();

    assert_eq!(output.tokens, vec![9, 9, 9, 9, 9]);
    // Each decode step advances the cache by exactly one.
    assert_eq!(offsets, vec![3, 4, 5, 6, 7]);
}

#[test]
fn test_eos_from_session_config() {
    let mut config = stub_config(1);
    config.eos_token_ids = vec![9];
    let mut session = Session::create(config.clone(), StubModel::new(config, 9)).unwrap();
    let output = session
        .generate(&[1], GenerationConfig::greedy(5), |_| StepControl::Continue)
        .unwrap();
    assert!(output.tokens.is_empty());
    assert_eq!(output.stop_reason, StopReason::Eos);
}

#[test]
fn test_callback_cancellation() {
    let config = stub_config(1);
    let mut session = Session::create(config.clone(), StubModel::new(config, 4)).unwrap();
    let mut seen = Vec::new();
    let output = session
        .generate(&[1, 2], GenerationConfig::greedy(50), |token| {
            seen.push(token);
            if seen.len() == 3 {
                StepControl::Stop
            } else {
                StepControl::Continue
            }
        })
        .unwrap();
    assert_eq!(output.tokens, vec![4, 4, 4]);
    assert_eq!(output.stop_reason, StopReason::Callback);
    assert_eq!(seen, output.tokens);
}

#[test]
fn test_session_rejects_bad_input_and_config() {
    let config = stub_config(1);
    let mut session = Session::create(config.clone(), StubModel::new(config.clone(), 1)).unwrap();
    assert!(matches!(session.forward(&[]), Err(ModelError::InvalidInput(_))));
    assert!(matches!(
        session.forward(&[VOCAB as u32]),
        Err(ModelError::InvalidInput(_))
    ));

    let mut bad = config.clone();
    bad.num_kv_heads = 3;
    assert!(Session::create(bad, StubModel::new(config.clone(), 1)).is_err());

    let mut mismatched = config.clone();
    mismatched.num_layers = 3;
    assert!(Session::create(mismatched, StubModel::new(config, 1)).is_err());
}

#[test]
fn test_rejected_prompt_keeps_cache() {
    let config = stub_config(1);
    let mut session = Session::create(config.clone(), StubModel::new(config, 2)).unwrap();
    session.forward(&[1, 2, 3]).unwrap();

    let params = GenerationConfig::greedy(4);
    assert!(matches!(
        session.generate(&[], params.clone(), |_| StepControl::Continue),
        Err(ModelError::InvalidInput(_))
    ));
    assert!(matches!(
        session.generate(&[VOCAB as u32], params, |_| StepControl::Continue),
        Err(ModelError::InvalidInput(_))
    ));
    assert_eq!(session.offset(), 3);
    assert_eq!(session.model().calls, vec![3]);
}

#[test]
fn test_forward_and_reset() {
    let config = stub_config(2);
    let mut session = Session::create(config.clone(), StubModel::new(config, 1)).unwrap();
    let logits = session.forward(&[1, 2, 3, 4]).unwrap();
    assert_eq!(logits.shape(), &[1, 4, VOCAB as i32]);
    assert_eq!(session.offset(), 4);
    assert!(session.cache().memory_usage() > 0);

    session.reset_cache();
    assert_eq!(session.offset(), 0);
    assert!(session.cache().is_empty());
    assert_eq!(session.cache().memory_usage(), 0);
}

#[test]
fn test_generate_response_json() {
    let config = stub_config(1);
    let mut session = Session::create(config.clone(), StubModel::new(config, 2)).unwrap();
    let reply = session.generate_response(&[1], GenerationConfig::greedy(2));
    let json = serde_json::to_value(&reply).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["tokens"], serde_json::json!([2, 2]));
    assert_eq!(json["tokenCount"], 2);

    let reply = session.generate_response(&[], GenerationConfig::greedy(2));
    assert!(!reply.success);
    assert!(reply.error.is_some());
}

#[test]
fn test_tiny_moe_session_generates() {
    init_tracing();
    let config = tiny_config();
    let model = TinyMoeModel::new(config.clone()).unwrap();
    let mut session = Session::create(config, model).unwrap();

    let output = session
        .generate(&[1, 2, 3, 4, 5], GenerationConfig::greedy(6), |_| StepControl::Continue)
        .unwrap();
    assert_eq!(output.token_count, 6);
    assert_eq!(output.stop_reason, StopReason::MaxTokens);
    assert!(output.tokens.iter().all(|&t| (t as usize) < 32));
    assert_eq!(session.offset(), 10);

    let cache = session.cache();
    assert_eq!(cache.layer(0).unwrap().offset(), 10);
    // The local layer keeps only its window.
    assert_eq!(cache.layer(1).unwrap().offset(), 4);
    assert_eq!(session.model().last_dispatch().len(), 2);
}

#[test]
fn test_tiny_moe_incremental_matches_prefill() {
    let config = tiny_config();
    let mut model = TinyMoeModel::new(config.clone()).unwrap();
    let tokens = [3u32, 1, 4, 1, 5, 9];

    let mut full_cache = KVCache::for_session(&config).unwrap();
    let ids: Vec<i32> = tokens.iter().map(|&t| t as i32).collect();
    let full = model
        .forward(&Array::from_slice(&ids, &[1, 6]), &mut full_cache)
        .unwrap();

    let mut step_cache = KVCache::for_session(&config).unwrap();
    model
        .forward(&Array::from_slice(&ids[..5], &[1, 5]), &mut step_cache)
        .unwrap();
    let last = model
        .forward(&Array::from_slice(&ids[5..], &[1, 1]), &mut step_cache)
        .unwrap();

    let expected = full.index((0, 5, ..));
    let actual = last.index((0, 0, ..));
    expected.eval().unwrap();
    actual.eval().unwrap();
    for (a, b) in expected
        .as_slice::<f32>()
        .iter()
        .zip(actual.as_slice::<f32>())
    {
        assert!((a - b).abs() < 1e-3, "{a} vs {b}");
    }
}
