//! Router and dispatcher wired together.

use mlx_rs::Array;
use strata_core::{MoeActivation, MoeConfig};
use strata_mlx::{
    DispatchPath, ExpertAssignment, ExpertDispatcher, ExpertRouter, ExpertWeights, MlxError,
    MoeLayer, WEIGHT_SUM_TOLERANCE,
};

const HIDDEN: i32 = 32;
const INTERMEDIATE: i32 = 48;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn random(shape: &[i32]) -> Array {
    mlx_rs::random::normal::<f32>(shape, None, None, None).unwrap()
}

fn host(x: &Array) -> Vec<f32> {
    x.eval().unwrap();
    x.as_slice::<f32>().to_vec()
}

#[test]
fn test_router_assignments_hold_invariants() {
    let config = MoeConfig::new(8, 3);
    let router = ExpertRouter::new_random(HIDDEN, &config).unwrap();
    let assignment = router.route(&random(&[40, HIDDEN])).unwrap();

    assert_eq!(assignment.num_tokens, 40);
    assert_eq!(assignment.index_array.shape(), &[40, 3]);
    assert_eq!(assignment.weight_array.shape(), &[40, 3]);
    for token in 0..40 {
        let (experts, weights) = assignment.token(token);
        assert_eq!(experts.len(), 3);
        let sum: f32 = weights.iter().sum();
        assert!((sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
        let mut sorted = experts.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
        assert!(experts.iter().all(|&e| e < 8));
        // Best expert first.
        assert!(weights.windows(2).all(|w| w[0] >= w[1]));
    }
}

#[test]
fn test_sorted_and_per_token_paths_agree() {
    init_tracing();
    for activation in [MoeActivation::Swiglu, MoeActivation::clipped()] {
        let config = MoeConfig::new(6, 2).with_activation(activation);
        let router = ExpertRouter::new_random(HIDDEN, &config).unwrap();
        let weights = ExpertWeights::new_random(6, HIDDEN, INTERMEDIATE).unwrap();
        let hidden = random(&[24, HIDDEN]);
        let assignment = router.route(&hidden).unwrap();

        let sorted = ExpertDispatcher::new(weights.clone(), &config).with_sort_threshold(0);
        let per_token = ExpertDispatcher::new(weights, &config).with_sort_threshold(usize::MAX);

        let (a, stats_a) = sorted.dispatch_with_stats(&hidden, &assignment).unwrap();
        let (b, stats_b) = per_token.dispatch_with_stats(&hidden, &assignment).unwrap();
        assert_eq!(stats_a.path, DispatchPath::Sorted);
        assert_eq!(stats_b.path, DispatchPath::PerToken);
        assert_eq!(stats_a.active_experts, stats_b.active_experts);
        assert_eq!(a.shape(), &[24, HIDDEN]);
        for (x, y) in host(&a).iter().zip(host(&b)) {
            assert!((x - y).abs() < 1e-4 * (1.0 + x.abs()), "{x} vs {y}");
        }
    }
}

#[test]
fn test_layer_preserves_batch_shape() {
    let config = MoeConfig::new(4, 2).with_sort_threshold(8);
    let layer = MoeLayer::new_random(HIDDEN, INTERMEDIATE, &config).unwrap();

    let (out, stats) = layer.forward(&random(&[2, 10, HIDDEN])).unwrap();
    assert_eq!(out.shape(), &[2, 10, HIDDEN]);
    assert_eq!(stats.num_tokens, 20);
    assert_eq!(stats.path, DispatchPath::Sorted);

    let (out, stats) = layer.forward(&random(&[1, 1, HIDDEN])).unwrap();
    assert_eq!(out.shape(), &[1, 1, HIDDEN]);
    assert_eq!(stats.path, DispatchPath::PerToken);
}

#[test]
fn test_assignment_cardinality_mismatch_is_invariant_violation() {
    let config = MoeConfig::new(4, 2);
    let dispatcher = ExpertDispatcher::new(
        ExpertWeights::new_random(4, HIDDEN, INTERMEDIATE).unwrap(),
        &config,
    );
    // Three routed tokens for four hidden rows.
    let assignment =
        ExpertAssignment::new(4, 2, vec![0, 1, 2, 3, 1, 2], vec![0.5; 6]).unwrap();
    assert!(matches!(
        dispatcher.dispatch(&random(&[4, HIDDEN]), &assignment),
        Err(MlxError::InvariantViolation(_))
    ));

    // Router and dispatcher must agree on the expert count.
    let router = ExpertRouter::new_random(HIDDEN, &MoeConfig::new(5, 2)).unwrap();
    assert!(MoeLayer::new(router, dispatcher).is_err());
}

#[test]
fn test_degenerate_router_logits() {
    let config = MoeConfig::new(4, 2);
    let router = ExpertRouter::new_random(HIDDEN, &config).unwrap();
    let nan = f32::NAN;
    let assignment = router
        .route_logits(&[nan, 2.0, nan, 1.0, nan, nan, nan, nan])
        .unwrap();

    let (experts, weights) = assignment.token(0);
    assert_eq!(experts, &[1, 3]);
    assert!(weights[0] > weights[1]);

    // Nothing finite: lowest indices, uniform weights.
    let (experts, weights) = assignment.token(1);
    assert_eq!(experts, &[0, 1]);
    assert_eq!(weights, &[0.5, 0.5]);
}
