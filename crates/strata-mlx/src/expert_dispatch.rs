//! Expert dispatch with sort-based batching.
//!
//! Small batches run each token's selected experts directly. Larger batches
//! sort `(token, slot)` pairs by expert so every expert runs once over a
//! contiguous block of rows:
//!
//! ```text
//! sort (expert, token * k + slot) pairs by expert (stable)
//! gather hidden rows into expert-contiguous order
//! for each run of one expert: gate/up/down as one batched matmul
//! scatter back with the inverse permutation
//! weighted sum over the k outputs of each token
//! ```
//!
//! Both paths compute the same function; sorting only changes how work is
//! batched. Experts that receive no tokens are never touched.

use crate::error::{MlxError, Result};
use crate::kernels::activations::gated_activation;
use crate::moe::ExpertAssignment;
use mlx_rs::{ops, ops::concatenate_axis, ops::indexing::IndexOp, Array};
use strata_core::{MoeActivation, MoeConfig};
use tracing::debug;

/// Expert weights stored in contiguous tensors:
/// - `gate_proj`: `[num_experts, hidden_size, intermediate_size]`
/// - `up_proj`: `[num_experts, hidden_size, intermediate_size]`
/// - `down_proj`: `[num_experts, intermediate_size, hidden_size]`
#[derive(Debug, Clone)]
pub struct ExpertWeights {
    gate_proj: Array,
    up_proj: Array,
    down_proj: Array,
}

impl ExpertWeights {
    /// Wrap stacked expert projections, checking that their shapes agree.
    pub fn new(gate_proj: Array, up_proj: Array, down_proj: Array) -> Result<Self> {
        if gate_proj.ndim() != 3 {
            return Err(MlxError::InvariantViolation(format!(
                "expert gate_proj must be rank 3, got rank {}",
                gate_proj.ndim()
            )));
        }
        let (e, h, i) = (gate_proj.dim(0), gate_proj.dim(1), gate_proj.dim(2));
        if up_proj.shape() != &[e, h, i] {
            return Err(MlxError::shape(&[e, h, i], up_proj.shape()));
        }
        if down_proj.shape() != &[e, i, h] {
            return Err(MlxError::shape(&[e, i, h], down_proj.shape()));
        }
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Create new randomly initialized weights.
    pub fn new_random(num_experts: usize, hidden_size: i32, intermediate_size: i32) -> Result<Self> {
        let std_dev = (2.0 / (hidden_size + intermediate_size) as f32).sqrt();
        let e = num_experts as i32;
        let gate_proj = mlx_rs::random::normal::<f32>(
            &[e, hidden_size, intermediate_size],
            None,
            Some(std_dev),
            None,
        )?;
        let up_proj = mlx_rs::random::normal::<f32>(
            &[e, hidden_size, intermediate_size],
            None,
            Some(std_dev),
            None,
        )?;
        let down_proj = mlx_rs::random::normal::<f32>(
            &[e, intermediate_size, hidden_size],
            None,
            Some(std_dev),
            None,
        )?;
        Self::new(gate_proj, up_proj, down_proj)
    }

    /// Number of experts.
    pub fn num_experts(&self) -> usize {
        self.gate_proj.dim(0) as usize
    }

    /// Hidden size.
    pub fn hidden_size(&self) -> i32 {
        self.gate_proj.dim(1)
    }

    /// Intermediate size of each expert.
    pub fn intermediate_size(&self) -> i32 {
        self.gate_proj.dim(2)
    }

    /// Run one expert over rows `[n, hidden]`.
    pub fn expert_forward(
        &self,
        expert: usize,
        x: &Array,
        activation: MoeActivation,
    ) -> Result<Array> {
        let e = expert as i32;
        let gate = x.matmul(self.gate_proj.index(e))?;
        let up = x.matmul(self.up_proj.index(e))?;
        let hidden = gated_activation(&gate, &up, activation)?;
        Ok(hidden.matmul(self.down_proj.index(e))?)
    }

    /// Run the `k` experts in `experts` over one row `[1, hidden]`,
    /// returning `[k, hidden]`.
    fn selected_forward(&self, experts: &Array, x: &Array, activation: MoeActivation) -> Result<Array> {
        let gate_w = self.gate_proj.take_axis(experts, 0)?;
        let up_w = self.up_proj.take_axis(experts, 0)?;
        let down_w = self.down_proj.take_axis(experts, 0)?;
        let x = x.reshape(&[1, 1, self.hidden_size()])?;
        let gate = x.matmul(&gate_w)?;
        let up = x.matmul(&up_w)?;
        let hidden = gated_activation(&gate, &up, activation)?;
        Ok(hidden.matmul(&down_w)?.reshape(&[-1, self.hidden_size()])?)
    }
}

/// Which dispatch strategy ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    /// Each token's experts run directly.
    PerToken,
    /// Rows sorted by expert, one batched call per expert run.
    Sorted,
}

/// What a dispatch call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    /// Strategy taken.
    pub path: DispatchPath,
    /// Tokens dispatched.
    pub num_tokens: usize,
    /// Experts that received at least one token.
    pub active_experts: usize,
    /// Rows in the busiest expert.
    pub largest_run: usize,
}

/// Runs routed experts and recombines their outputs.
#[derive(Debug, Clone)]
pub struct ExpertDispatcher {
    weights: ExpertWeights,
    activation: MoeActivation,
    sort_threshold: usize,
}

impl ExpertDispatcher {
    /// Create a dispatcher with the activation and sort threshold of `config`.
    pub fn new(weights: ExpertWeights, config: &MoeConfig) -> Self {
        Self {
            weights,
            activation: config.activation,
            sort_threshold: config.sort_threshold,
        }
    }

    /// Override the sort threshold.
    pub fn with_sort_threshold(mut self, sort_threshold: usize) -> Self {
        self.sort_threshold = sort_threshold;
        self
    }

    /// Expert weights.
    pub fn weights(&self) -> &ExpertWeights {
        &self.weights
    }

    /// Combine the routed experts' outputs for hidden states `[N, hidden]`.
    pub fn dispatch(&self, hidden: &Array, assignment: &ExpertAssignment) -> Result<Array> {
        Ok(self.dispatch_with_stats(hidden, assignment)?.0)
    }

    /// Like [`Self::dispatch`], also reporting what ran.
    pub fn dispatch_with_stats(
        &self,
        hidden: &Array,
        assignment: &ExpertAssignment,
    ) -> Result<(Array, DispatchStats)> {
        self.check(hidden, assignment)?;
        let hidden = hidden.as_type::<f32>()?;

        let mut counts = vec![0usize; self.weights.num_experts()];
        for &e in &assignment.indices {
            counts[e as usize] += 1;
        }
        let path = if assignment.num_tokens < self.sort_threshold {
            DispatchPath::PerToken
        } else {
            DispatchPath::Sorted
        };
        let stats = DispatchStats {
            path,
            num_tokens: assignment.num_tokens,
            active_experts: counts.iter().filter(|&&c| c > 0).count(),
            largest_run: counts.iter().copied().max().unwrap_or(0),
        };

        let out = if assignment.num_tokens == 0 {
            ops::zeros::<f32>(&[0, self.weights.hidden_size()])?
        } else {
            match path {
                DispatchPath::PerToken => self.per_token(&hidden, assignment)?,
                DispatchPath::Sorted => self.sorted(&hidden, assignment)?,
            }
        };
        debug!(
            path = ?stats.path,
            tokens = stats.num_tokens,
            active_experts = stats.active_experts,
            largest_run = stats.largest_run,
            "expert dispatch"
        );
        Ok((out, stats))
    }

    fn check(&self, hidden: &Array, assignment: &ExpertAssignment) -> Result<()> {
        if hidden.ndim() != 2 {
            return Err(MlxError::InvariantViolation(format!(
                "dispatch expects [tokens, hidden], got rank {}",
                hidden.ndim()
            )));
        }
        if hidden.dim(1) != self.weights.hidden_size() {
            return Err(MlxError::shape(
                &[hidden.dim(0), self.weights.hidden_size()],
                hidden.shape(),
            ));
        }
        if hidden.dim(0) as usize != assignment.num_tokens {
            return Err(MlxError::InvariantViolation(format!(
                "router assigned {} tokens, dispatcher received {}",
                assignment.num_tokens,
                hidden.dim(0)
            )));
        }
        if assignment.num_experts != self.weights.num_experts() {
            return Err(MlxError::InvariantViolation(format!(
                "router scored {} experts, dispatcher holds {}",
                assignment.num_experts,
                self.weights.num_experts()
            )));
        }
        Ok(())
    }

    fn per_token(&self, hidden: &Array, assignment: &ExpertAssignment) -> Result<Array> {
        let k = assignment.top_k as i32;
        let mut rows = Vec::with_capacity(assignment.num_tokens);
        for t in 0..assignment.num_tokens {
            let row = t as i32;
            let experts = assignment.index_array.index(row);
            let weights = assignment.weight_array.index(row).reshape(&[k, 1])?;
            let outs = self
                .weights
                .selected_forward(&experts, &hidden.index(row..row + 1), self.activation)?;
            rows.push(outs.multiply(&weights)?.sum_axis(0, Some(true))?);
        }
        Ok(concatenate_axis(&rows[..], 0)?)
    }

    fn sorted(&self, hidden: &Array, assignment: &ExpertAssignment) -> Result<Array> {
        let k = assignment.top_k;
        let n_rows = assignment.indices.len();

        // Stable sort keeps token order within each expert.
        let mut order: Vec<usize> = (0..n_rows).collect();
        order.sort_by_key(|&slot| assignment.indices[slot]);

        let mut inverse = vec![0i32; n_rows];
        for (sorted_pos, &slot) in order.iter().enumerate() {
            inverse[slot] = sorted_pos as i32;
        }
        let tokens: Vec<i32> = order.iter().map(|&slot| (slot / k) as i32).collect();
        let gathered = hidden.take_axis(&Array::from_slice(&tokens, &[n_rows as i32]), 0)?;

        let mut outputs = Vec::new();
        let mut start = 0;
        while start < n_rows {
            let expert = assignment.indices[order[start]];
            let mut end = start + 1;
            while end < n_rows && assignment.indices[order[end]] == expert {
                end += 1;
            }
            let rows = gathered.index(start as i32..end as i32);
            outputs.push(
                self.weights
                    .expert_forward(expert as usize, &rows, self.activation)?,
            );
            start = end;
        }

        let sorted_out = concatenate_axis(&outputs[..], 0)?;
        let restored = sorted_out.take_axis(&Array::from_slice(&inverse, &[n_rows as i32]), 0)?;
        let hidden_size = self.weights.hidden_size();
        let per_slot = restored.reshape(&[assignment.num_tokens as i32, k as i32, hidden_size])?;
        let weights = assignment
            .weight_array
            .reshape(&[assignment.num_tokens as i32, k as i32, 1])?;
        Ok(per_slot.multiply(&weights)?.sum_axis(1, None)?)
    }
}
