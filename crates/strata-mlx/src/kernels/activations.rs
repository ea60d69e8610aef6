//! Gated activations for expert feed-forward blocks.
//!
//! - SwiGLU: `silu(gate) * up`
//! - Clipped SwiGLU (sink-attention MoE models):
//!
//! ```text
//! gate = clip(gate, -limit, limit)
//! up   = clip(up, -limit, limit)
//! out  = gate * sigmoid(alpha * gate) * (up + 1)
//! ```

use mlx_rs::{error::Exception, ops, Array};
use strata_core::MoeActivation;

/// Apply SwiGLU activation: swish(gate) * up.
pub fn swiglu(gate: &Array, up: &Array) -> Result<Array, Exception> {
    mlx_rs::nn::silu(gate)?.multiply(up)
}

/// Clipped SwiGLU with a scaled sigmoid gate.
pub fn clipped_swiglu(gate: &Array, up: &Array, alpha: f32, limit: f32) -> Result<Array, Exception> {
    let gate = clip(gate, limit)?;
    let up = clip(up, limit)?;
    let glu = gate.multiply(ops::sigmoid(gate.multiply(Array::from_f32(alpha))?)?)?;
    glu.multiply(up.add(Array::from_f32(1.0))?)
}

fn clip(x: &Array, limit: f32) -> Result<Array, Exception> {
    ops::maximum(ops::minimum(x, Array::from_f32(limit))?, Array::from_f32(-limit))
}

/// Apply the configured expert activation.
pub fn gated_activation(
    gate: &Array,
    up: &Array,
    activation: MoeActivation,
) -> Result<Array, Exception> {
    match activation {
        MoeActivation::Swiglu => swiglu(gate, up),
        MoeActivation::ClippedSwiglu { alpha, limit } => clipped_swiglu(gate, up, alpha, limit),
    }
}
