//! Attention mask construction.
//!
//! Masks are boolean `[query_len, key_len]` arrays where `true` means the
//! query may attend to the key. Query `i` of a step that starts at absolute
//! position `offset` may attend to absolute position `j` iff
//!
//! ```text
//! j <= i + offset  &&  (window is None || i + offset - j < window)
//! ```
//!
//! The cache decides which mask a step needs (see [`LayerCache::make_mask`]);
//! single-query steps with no window restriction need none at all.
//!
//! [`LayerCache::make_mask`]: crate::kv_cache::LayerCache::make_mask

use crate::error::{MlxError, Result};
use crate::kv_cache::LayerCache;
use mlx_rs::{ops::tri, Array, Dtype};

/// Mask descriptor handed to attention.
#[derive(Debug, Clone)]
pub enum AttentionMask {
    /// Every query may attend to every retained key.
    None,
    /// Causal mask over the retained keys.
    Causal(Array),
    /// Causal mask additionally limited to a trailing window.
    SlidingWindow(Array),
}

impl AttentionMask {
    /// Whether this is the no-mask marker.
    pub fn is_none(&self) -> bool {
        matches!(self, AttentionMask::None)
    }

    /// Boolean mask array, if any.
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            AttentionMask::None => None,
            AttentionMask::Causal(mask) | AttentionMask::SlidingWindow(mask) => Some(mask),
        }
    }

    /// Additive form: `0` where attention is allowed, `-inf` elsewhere.
    pub fn to_additive(&self, dtype: Dtype) -> Result<Option<Array>> {
        let Some(mask) = self.as_array() else {
            return Ok(None);
        };
        let zero = Array::from_f32(0.0);
        let neg_inf = Array::from_f32(f32::NEG_INFINITY);
        let additive = mlx_rs::ops::r#where(mask, &zero, &neg_inf)?;
        Ok(Some(additive.as_dtype(dtype)?))
    }
}

/// Whether a query at absolute position `query` may attend to `key`.
///
/// The first `sinks` positions are exempt from the window.
#[inline]
pub fn may_attend(query: usize, key: usize, window: Option<usize>, sinks: usize) -> bool {
    if key > query {
        return false;
    }
    match window {
        Some(w) if key >= sinks => query - key < w,
        _ => true,
    }
}

/// Boolean mask for arbitrary query and key positions, built on the host.
///
/// Used for caches whose slots are not in temporal order.
///
/// Returns the mask and whether the window excluded any causally visible key.
pub fn mask_from_positions(
    query_positions: &[usize],
    key_positions: &[usize],
    window: Option<usize>,
    sinks: usize,
) -> (Array, bool) {
    let mut data = Vec::with_capacity(query_positions.len() * key_positions.len());
    let mut windowed = false;
    for &q in query_positions {
        for &k in key_positions {
            let allowed = may_attend(q, k, window, sinks);
            windowed |= !allowed && k <= q;
            data.push(allowed);
        }
    }
    let shape = [query_positions.len() as i32, key_positions.len() as i32];
    (Array::from_slice(&data, &shape), windowed)
}

/// Causal mask of shape `[query_len, offset + query_len]`, built on the device.
pub fn create_causal_mask(query_len: usize, offset: usize, window: Option<usize>) -> Result<Array> {
    if query_len == 0 {
        return Err(MlxError::InvalidArgument("query_len must be positive".into()));
    }
    if window == Some(0) {
        return Err(MlxError::InvalidArgument("window must be positive".into()));
    }
    let to_i32 = |v: usize| {
        i32::try_from(v).map_err(|_| MlxError::InvalidArgument(format!("mask extent {v} exceeds i32")))
    };
    let q = to_i32(query_len)?;
    let start = to_i32(offset)?;
    let k = start + q;

    // Ones where key j <= query i + offset.
    let causal = tri::<f32>(q, Some(k), Some(start))?;
    let visible = match window {
        None => causal,
        Some(w) => {
            // Ones where j <= i + offset - window, i.e. too far back.
            let stale = tri::<f32>(q, Some(k), Some(start - to_i32(w)?))?;
            causal.subtract(&stale)?
        }
    };
    Ok(visible.gt(&Array::from_f32(0.0))?)
}

/// Mask for the next attention step of a layer, delegated to its cache.
///
/// For contiguous caches the mask has shape `[query_len, offset + query_len]`.
pub fn create_attention_mask(
    cache: &LayerCache,
    query_len: usize,
    window: Option<usize>,
) -> Result<AttentionMask> {
    cache.make_mask(query_len, window)
}
