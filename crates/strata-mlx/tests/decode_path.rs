//! Cache, mask and attention together: every cache layout must produce the
//! same attention output as recomputing over the full history.

use mlx_rs::{ops::indexing::IndexOp, Array};
use strata_core::CacheConfig;
use strata_mlx::kernels::attend;
use strata_mlx::mask::mask_from_positions;
use strata_mlx::{AttentionMask, KVCache, LayerCache};

const HEADS: i32 = 4;
const KV_HEADS: i32 = 2;
const HEAD_DIM: i32 = 64;
const TOKENS: i32 = 12;
const PREFILL: i32 = 5;

fn random(shape: &[i32]) -> Array {
    mlx_rs::random::normal::<f32>(shape, None, None, None).unwrap()
}

fn host(x: &Array) -> Vec<f32> {
    x.eval().unwrap();
    x.as_slice::<f32>().to_vec()
}

fn max_abs_diff(a: &Array, b: &Array) -> f32 {
    host(a)
        .iter()
        .zip(host(b))
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Attention of queries at `positions` over the full history up to the last one.
fn reference(
    queries: &Array,
    keys: &Array,
    values: &Array,
    positions: &[usize],
    window: Option<usize>,
    sinks: usize,
) -> Array {
    let last = *positions.last().unwrap();
    let key_positions: Vec<usize> = (0..=last).collect();
    let (mask, _) = mask_from_positions(positions, &key_positions, window, sinks);
    let len = last as i32 + 1;
    attend(
        queries,
        &keys.index((.., .., ..len, ..)),
        &values.index((.., .., ..len, ..)),
        (HEAD_DIM as f32).powf(-0.5),
        &AttentionMask::Causal(mask),
        None,
    )
    .unwrap()
}

/// Prefill then single-token decode through `config`, checking every step.
fn run_against_reference(config: CacheConfig, window: Option<usize>, sinks: usize, tol: f32) -> KVCache {
    let keys = random(&[1, KV_HEADS, TOKENS, HEAD_DIM]);
    let values = random(&[1, KV_HEADS, TOKENS, HEAD_DIM]);
    let queries = random(&[1, HEADS, TOKENS, HEAD_DIM]);
    let scale = (HEAD_DIM as f32).powf(-0.5);
    let mut cache = KVCache::new(1, &config).unwrap();

    let mut start = 0;
    for len in std::iter::once(PREFILL).chain(std::iter::repeat(1).take((TOKENS - PREFILL) as usize)) {
        let range = start..start + len;
        let q = queries.index((.., .., range.clone(), ..));
        let mask = cache.make_mask(0, len as usize, None).unwrap();
        let (k, v) = cache
            .update_and_fetch(
                0,
                &keys.index((.., .., range.clone(), ..)),
                &values.index((.., .., range.clone(), ..)),
            )
            .unwrap();
        assert_eq!(mask.as_array().map(|m| m.dim(1)).unwrap_or(k.dim(2)), k.dim(2));

        let out = attend(&q, &k, &v, scale, &mask, None).unwrap();
        let positions: Vec<usize> = (range.start as usize..range.end as usize).collect();
        let expected = reference(&q, &keys, &values, &positions, window, sinks);
        let diff = max_abs_diff(&out, &expected);
        assert!(diff < tol, "step at {start}: diff {diff}");
        start += len;
    }
    cache
}

/// First `head` positions of `x` followed by position `tail`.
fn head_then(x: &Array, head: i32, tail: i32) -> Array {
    mlx_rs::ops::concatenate_axis(
        &[
            x.index((.., .., ..head, ..)),
            x.index((.., .., tail..tail + 1, ..)),
        ],
        2,
    )
    .unwrap()
}

#[test]
fn test_standard_cache_matches_full_attention() {
    let cache = run_against_reference(CacheConfig::standard().with_step(4), None, 0, 1e-4);
    assert_eq!(cache.offset(), TOKENS as usize);
}

#[test]
fn test_rotating_cache_matches_windowed_attention() {
    let cache = run_against_reference(CacheConfig::rotating(4, 2), Some(4), 2, 1e-4);
    let Some(LayerCache::Rotating(rotating)) = cache.layer(0) else {
        panic!("expected a rotating layer");
    };
    assert_eq!(rotating.offset(), 6);
    assert_eq!(rotating.total_tokens(), TOKENS as usize);
    assert_eq!(cache.rope_offset(), TOKENS as usize);
    // Sinks survive every eviction.
    assert!(rotating.slot_positions().contains(&0));
    assert!(rotating.slot_positions().contains(&1));
}

#[test]
fn test_quantized_cache_tracks_full_attention() {
    let cache = run_against_reference(CacheConfig::quantized(8, 64).with_step(4), None, 0, 5e-2);
    assert_eq!(cache.offset(), TOKENS as usize);
}

#[test]
fn test_trim_then_continue_matches_fresh_history() {
    let config = CacheConfig::standard().with_step(4);
    let keys = random(&[1, KV_HEADS, 8, HEAD_DIM]);
    let values = random(&[1, KV_HEADS, 8, HEAD_DIM]);

    let mut cache = KVCache::new(1, &config).unwrap();
    cache
        .update_and_fetch(0, &keys.index((.., .., ..6, ..)), &values.index((.., .., ..6, ..)))
        .unwrap();
    assert!(cache.is_trimmable());
    cache.trim(2).unwrap();
    let (k, _) = cache
        .update_and_fetch(0, &keys.index((.., .., 6..7, ..)), &values.index((.., .., 6..7, ..)))
        .unwrap();

    assert_eq!(k.shape(), &[1, KV_HEADS, 5, HEAD_DIM]);
    let expected = head_then(&keys, 4, 6);
    assert!(max_abs_diff(&k, &expected) < 1e-6);
}

#[test]
fn test_mixed_layers_share_rope_offset() {
    let configs = [CacheConfig::standard(), CacheConfig::rotating(3, 1)];
    let mut cache = KVCache::from_layer_configs(&configs).unwrap();
    let kv = Array::zeros::<f32>(&[1, KV_HEADS, 1, HEAD_DIM]).unwrap();
    for _ in 0..9 {
        cache.update_and_fetch(0, &kv, &kv).unwrap();
        cache.update_and_fetch(1, &kv, &kv).unwrap();
    }
    assert_eq!(cache.layer(0).unwrap().rope_offset(), 9);
    assert_eq!(cache.layer(1).unwrap().rope_offset(), 9);
    assert_eq!(cache.layer(1).unwrap().offset(), 4);
    // The steady-state rotating step still needs a window mask once the
    // window is narrower than what the cache could show.
    assert!(cache.make_mask(1, 1, Some(2)).unwrap().as_array().is_some());
    assert!(cache.make_mask(0, 1, None).unwrap().is_none());
}
