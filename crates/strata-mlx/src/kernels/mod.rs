//! MLX kernels used on the decode path.
//!
//! - Rotary position embeddings with linear, Llama3, YaRN and LongRoPE scaling
//! - Scaled dot-product attention with GQA expansion and sink logits
//! - SwiGLU and clipped SwiGLU expert activations

pub mod activations;
pub mod attention;
pub mod rope;

pub use activations::*;
pub use attention::*;
pub use rope::*;
