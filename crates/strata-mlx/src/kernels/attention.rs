//! Scaled dot-product attention over cached keys/values.
//!
//! Without sinks this defers to MLX's fused SDPA, which handles GQA/MQA
//! natively. With sinks, each head carries one learned logit that joins the
//! softmax as an extra key with no value: it absorbs probability mass and is
//! then dropped, so the remaining weights sum to less than one.

use crate::error::{MlxError, Result};
use crate::mask::AttentionMask;
use mlx_rs::{
    error::Exception,
    fast::{scaled_dot_product_attention, ScaledDotProductAttentionMask},
    ops::{self, concatenate_axis, indexing::IndexOp},
    Array,
};

/// Attention over `[B, heads, L, D]` queries and `[B, kv_heads, S, D]` history.
///
/// `sinks`, when present, holds one logit per query head.
pub fn attend(
    queries: &Array,
    keys: &Array,
    values: &Array,
    scale: f32,
    mask: &AttentionMask,
    sinks: Option<&Array>,
) -> Result<Array> {
    let (n_heads, n_kv_heads) = check_heads(queries, keys, values)?;
    let additive = mask.to_additive(queries.dtype())?;

    let Some(sinks) = sinks else {
        let out = match &additive {
            Some(m) => scaled_dot_product_attention(queries, keys, values, scale, m)?,
            None => scaled_dot_product_attention(
                queries,
                keys,
                values,
                scale,
                Option::<ScaledDotProductAttentionMask>::None,
            )?,
        };
        return Ok(out);
    };

    if sinks.shape() != &[n_heads] {
        return Err(MlxError::shape(&[n_heads], sinks.shape()));
    }
    let (keys, values) = if n_kv_heads < n_heads {
        let repeats = n_heads / n_kv_heads;
        (expand_kv_heads(keys, repeats)?, expand_kv_heads(values, repeats)?)
    } else {
        (keys.clone(), values.clone())
    };

    let (batch, q_len, kv_len) = (queries.dim(0), queries.dim(2), keys.dim(2));
    let scores = queries
        .as_type::<f32>()?
        .matmul(keys.as_type::<f32>()?.transpose_axes(&[0, 1, 3, 2])?)?
        .multiply(Array::from_f32(scale))?;
    let scores = match additive {
        Some(m) => scores.add(m.as_type::<f32>()?)?,
        None => scores,
    };

    let sink_logits = ops::broadcast_to(
        sinks.as_type::<f32>()?.reshape(&[1, n_heads, 1, 1])?,
        &[batch, n_heads, q_len, 1],
    )?;
    let scores = concatenate_axis(&[scores, sink_logits], -1)?;
    let weights = ops::softmax_axis(&scores, -1, None)?.index((.., .., .., ..kv_len));
    let out = weights.matmul(values.as_type::<f32>()?)?;
    Ok(out.as_dtype(queries.dtype())?)
}

fn check_heads(queries: &Array, keys: &Array, values: &Array) -> Result<(i32, i32)> {
    if queries.ndim() != 4 || keys.ndim() != 4 || values.ndim() != 4 {
        return Err(MlxError::InvariantViolation(
            "attention expects rank-4 queries, keys and values".into(),
        ));
    }
    let (n_heads, n_kv_heads) = (queries.dim(1), keys.dim(1));
    if keys.shape() != values.shape() || n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(MlxError::shape(keys.shape(), values.shape()));
    }
    if queries.dim(3) != keys.dim(3) || queries.dim(0) != keys.dim(0) {
        return Err(MlxError::shape(queries.shape(), keys.shape()));
    }
    Ok((n_heads, n_kv_heads))
}

/// Expand K/V heads for grouped query attention.
///
/// [batch, n_kv_heads, seq_len, head_dim] -> [batch, n_heads, seq_len, head_dim]
pub fn expand_kv_heads(x: &Array, repeats: i32) -> std::result::Result<Array, Exception> {
    let shape = x.shape();
    let (batch, n_kv_heads, seq_len, head_dim) = (shape[0], shape[1], shape[2], shape[3]);
    let x = x.reshape(&[batch, n_kv_heads, 1, seq_len, head_dim])?;
    let x = ops::broadcast_to(&x, &[batch, n_kv_heads, repeats, seq_len, head_dim])?;
    x.reshape(&[batch, n_kv_heads * repeats, seq_len, head_dim])
}
