//! Mixture of Experts (MoE) routing.
//!
//! ## How It Works
//!
//! 1. **Router**: a linear projection scores every expert for every token
//! 2. **Top-K Selection**: a partial selection (`select_nth_unstable_by`,
//!    average O(n)) keeps the `k` highest logits; ties go to the lower expert
//!    index
//! 3. **Gating**: softmax over the selected logits, so each token's weights
//!    sum to one
//! 4. **Dispatch**: [`ExpertDispatcher`] runs the selected experts and
//!    combines their outputs
//!
//! [`MoeLayer`] chains the router and dispatcher for a transformer block.

use crate::error::{MlxError, Result};
use crate::expert_dispatch::{DispatchStats, ExpertDispatcher, ExpertWeights};
use mlx_rs::Array;
use std::cmp::Ordering;
use strata_core::MoeConfig;

/// Tolerance used when checking that gating weights sum to one.
pub const WEIGHT_SUM_TOLERANCE: f32 = 1e-4;

/// Per-token top-k expert selection.
#[derive(Debug, Clone)]
pub struct ExpertAssignment {
    /// Number of routed tokens.
    pub num_tokens: usize,
    /// Experts per token.
    pub top_k: usize,
    /// Experts available to the router.
    pub num_experts: usize,
    /// Selected experts, `[num_tokens * top_k]`, best first per token.
    pub indices: Vec<u32>,
    /// Gating weights aligned with `indices`.
    pub weights: Vec<f32>,
    /// `indices` as an int32 array of shape `[num_tokens, top_k]`.
    pub index_array: Array,
    /// `weights` as a float32 array of shape `[num_tokens, top_k]`.
    pub weight_array: Array,
}

impl ExpertAssignment {
    /// Build an assignment from host-side selections.
    pub fn new(
        num_experts: usize,
        top_k: usize,
        indices: Vec<u32>,
        weights: Vec<f32>,
    ) -> Result<Self> {
        if top_k == 0 || indices.len() != weights.len() || indices.len() % top_k != 0 {
            return Err(MlxError::InvariantViolation(format!(
                "assignment has {} indices and {} weights for top_k {top_k}",
                indices.len(),
                weights.len()
            )));
        }
        let num_tokens = indices.len() / top_k;
        let shape = [num_tokens as i32, top_k as i32];
        let as_i32: Vec<i32> = indices.iter().map(|&e| e as i32).collect();
        let assignment = Self {
            num_tokens,
            top_k,
            num_experts,
            index_array: Array::from_slice(&as_i32, &shape),
            weight_array: Array::from_slice(&weights, &shape),
            indices,
            weights,
        };
        assignment.validate()?;
        Ok(assignment)
    }

    /// Experts and weights of one token.
    pub fn token(&self, token: usize) -> (&[u32], &[f32]) {
        let range = token * self.top_k..(token + 1) * self.top_k;
        (&self.indices[range.clone()], &self.weights[range])
    }

    /// Check the routing invariants: indices in range and distinct per token,
    /// weights summing to one.
    pub fn validate(&self) -> Result<()> {
        for token in 0..self.num_tokens {
            let (experts, weights) = self.token(token);
            for (j, &e) in experts.iter().enumerate() {
                if e as usize >= self.num_experts {
                    return Err(MlxError::InvariantViolation(format!(
                        "token {token} routed to expert {e}, only {} exist",
                        self.num_experts
                    )));
                }
                if experts[..j].contains(&e) {
                    return Err(MlxError::InvariantViolation(format!(
                        "token {token} routed to expert {e} twice"
                    )));
                }
            }
            let sum: f32 = weights.iter().sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(MlxError::InvariantViolation(format!(
                    "token {token} gating weights sum to {sum}"
                )));
            }
        }
        Ok(())
    }
}

/// Order by logit descending, then expert index ascending. NaN ranks last.
fn rank(row: &[f32], a: usize, b: usize) -> Ordering {
    let key = |i: usize| {
        let v = row[i];
        if v.is_nan() {
            f32::NEG_INFINITY
        } else {
            v
        }
    };
    key(b)
        .partial_cmp(&key(a))
        .unwrap_or(Ordering::Equal)
        .then(a.cmp(&b))
}

/// Indices of the `k` largest entries of `row`, best first.
pub fn select_top_k(row: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    let k = k.min(row.len());
    if k == 0 {
        return Vec::new();
    }
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, |&a, &b| rank(row, a, b));
        order.truncate(k);
    }
    order.sort_unstable_by(|&a, &b| rank(row, a, b));
    order
}

/// Softmax of the logits at `selected`.
fn gate_weights(row: &[f32], selected: &[usize]) -> Vec<f32> {
    let max = selected
        .iter()
        .map(|&i| row[i])
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![1.0 / selected.len() as f32; selected.len()];
    }
    let exps: Vec<f32> = selected
        .iter()
        .map(|&i| {
            let v = row[i];
            if v.is_nan() {
                0.0
            } else {
                (v - max).exp()
            }
        })
        .collect();
    let total: f32 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

/// Top-k router.
#[derive(Debug, Clone)]
pub struct ExpertRouter {
    /// Router gate `[hidden_size, num_experts]`.
    gate: Array,
    /// Optional per-expert bias `[num_experts]`.
    bias: Option<Array>,
    num_experts: usize,
    top_k: usize,
}

impl ExpertRouter {
    /// Create a router from a gate of shape `[hidden_size, num_experts]`.
    pub fn new(gate: Array, bias: Option<Array>, config: &MoeConfig) -> Result<Self> {
        config.validate()?;
        if gate.ndim() != 2 || gate.dim(1) as usize != config.num_experts {
            return Err(MlxError::shape(
                &[gate.dim(0), config.num_experts as i32],
                gate.shape(),
            ));
        }
        if let Some(b) = &bias {
            if b.shape() != &[config.num_experts as i32] {
                return Err(MlxError::shape(&[config.num_experts as i32], b.shape()));
            }
        }
        Ok(Self {
            gate,
            bias,
            num_experts: config.num_experts,
            top_k: config.top_k,
        })
    }

    /// Create a router with random weights.
    pub fn new_random(hidden_size: i32, config: &MoeConfig) -> Result<Self> {
        let gate = mlx_rs::random::normal::<f32>(
            &[hidden_size, config.num_experts as i32],
            None,
            Some(0.02),
            None,
        )?;
        Self::new(gate, None, config)
    }

    /// Number of experts.
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Experts per token.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Router logits `[N, num_experts]` for hidden states `[N, hidden]`.
    pub fn logits(&self, hidden: &Array) -> Result<Array> {
        if hidden.ndim() != 2 || hidden.dim(1) != self.gate.dim(0) {
            return Err(MlxError::shape(&[-1, self.gate.dim(0)], hidden.shape()));
        }
        let logits = hidden.as_type::<f32>()?.matmul(&self.gate)?;
        Ok(match &self.bias {
            Some(b) => logits.add(b)?,
            None => logits,
        })
    }

    /// Route hidden states `[N, hidden]` to their top-k experts.
    pub fn route(&self, hidden: &Array) -> Result<ExpertAssignment> {
        let logits = self.logits(hidden)?;
        logits.eval()?;
        self.route_logits(logits.as_slice::<f32>())
    }

    /// Route precomputed logits, `num_experts` per token.
    pub fn route_logits(&self, logits: &[f32]) -> Result<ExpertAssignment> {
        if logits.len() % self.num_experts != 0 {
            return Err(MlxError::InvariantViolation(format!(
                "{} router logits do not split into rows of {}",
                logits.len(),
                self.num_experts
            )));
        }
        let num_tokens = logits.len() / self.num_experts;
        let mut indices = Vec::with_capacity(num_tokens * self.top_k);
        let mut weights = Vec::with_capacity(num_tokens * self.top_k);
        for row in logits.chunks_exact(self.num_experts) {
            let selected = select_top_k(row, self.top_k);
            weights.extend(gate_weights(row, &selected));
            indices.extend(selected.into_iter().map(|e| e as u32));
        }
        ExpertAssignment::new(self.num_experts, self.top_k, indices, weights)
    }
}

/// Router plus dispatcher for one transformer block.
#[derive(Debug, Clone)]
pub struct MoeLayer {
    /// Router.
    pub router: ExpertRouter,
    /// Dispatcher.
    pub dispatcher: ExpertDispatcher,
}

impl MoeLayer {
    /// Create a layer from a router and dispatcher that agree on the expert count.
    pub fn new(router: ExpertRouter, dispatcher: ExpertDispatcher) -> Result<Self> {
        if router.num_experts() != dispatcher.weights().num_experts() {
            return Err(MlxError::InvariantViolation(format!(
                "router scores {} experts, dispatcher holds {}",
                router.num_experts(),
                dispatcher.weights().num_experts()
            )));
        }
        Ok(Self { router, dispatcher })
    }

    /// Create a layer with random weights.
    pub fn new_random(hidden_size: i32, intermediate_size: i32, config: &MoeConfig) -> Result<Self> {
        let router = ExpertRouter::new_random(hidden_size, config)?;
        let weights = ExpertWeights::new_random(config.num_experts, hidden_size, intermediate_size)?;
        let dispatcher = ExpertDispatcher::new(weights, config);
        Self::new(router, dispatcher)
    }

    /// Forward `[..., hidden]` hidden states through routed experts.
    pub fn forward(&self, hidden: &Array) -> Result<(Array, DispatchStats)> {
        let shape = hidden.shape().to_vec();
        let hidden_size = *shape
            .last()
            .ok_or_else(|| MlxError::InvariantViolation("MoE input is a scalar".into()))?;
        let flat = hidden.reshape(&[-1, hidden_size])?;
        let assignment = self.router.route(&flat)?;
        let (out, stats) = self.dispatcher.dispatch_with_stats(&flat, &assignment)?;
        Ok((out.reshape(&shape)?.as_dtype(hidden.dtype())?, stats))
    }
}
