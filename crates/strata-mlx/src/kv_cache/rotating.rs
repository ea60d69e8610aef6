//! Fixed-size cache with sink tokens (MLX-LM parity).
//!
//! The buffer holds `keep + window` slots. Slots `[0, keep)` receive the
//! first `keep` tokens of the sequence and are never overwritten. The
//! remaining `window` slots form a ring: once full, each new token replaces
//! the oldest non-sink token.
//!
//! Single-token updates write in place and return the buffer in slot order.
//! That order is not temporal, which is harmless because RoPE has already
//! been applied to the keys and a single query needs no mask. Multi-token
//! updates are returned in temporal order so the causal mask lines up; the
//! stored buffer is then compacted back to `keep + window` slots.
//!
//! Every slot's absolute position is tracked host-side, which is what masks
//! and rollback are computed from.

use super::{check_layout, check_update};
use crate::error::{MlxError, Result};
use crate::mask::{mask_from_positions, AttentionMask};
use mlx_rs::{
    ops,
    ops::concatenate_axis,
    ops::indexing::{IndexOp, TryIndexMutOp},
    Array,
};
use tracing::{debug, trace};

/// Rotating key/value cache.
#[derive(Debug, Clone)]
pub struct RotatingCache {
    keys: Option<Array>,
    values: Option<Array>,
    /// Absolute position held by each filled slot.
    slot_positions: Vec<usize>,
    window: usize,
    keep: usize,
    step: usize,
    /// Next ring slot to overwrite once full.
    idx: usize,
    /// Tokens seen since the last reset.
    total: usize,
    allocated: usize,
}

impl RotatingCache {
    /// Create an empty cache with `window` live slots and `keep` sink slots.
    pub fn new(window: usize, keep: usize, step: usize) -> Self {
        Self {
            keys: None,
            values: None,
            slot_positions: Vec::new(),
            window: window.max(1),
            keep,
            step: step.max(1),
            idx: 0,
            total: 0,
            allocated: 0,
        }
    }

    /// Total slots (`window + keep`).
    pub fn max_size(&self) -> usize {
        self.window + self.keep
    }

    /// Live window size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of sink slots.
    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Retained tokens, capped at `window + keep`.
    pub fn offset(&self) -> usize {
        self.slot_positions.len()
    }

    /// Tokens seen, including evicted ones.
    pub fn total_tokens(&self) -> usize {
        self.total
    }

    /// Allocated slots.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Absolute position held by each slot, in slot order.
    pub fn slot_positions(&self) -> &[usize] {
        &self.slot_positions
    }

    fn has_evicted(&self) -> bool {
        self.total > self.slot_positions.len()
    }

    /// Largest rollback that stays inside retained history.
    ///
    /// Once anything has been evicted, sinks are no longer contiguous with
    /// the live window, so only the window itself can be rolled back.
    pub fn trimmable(&self) -> usize {
        let filled = self.slot_positions.len();
        if self.has_evicted() {
            filled - self.keep.min(filled)
        } else {
            filled
        }
    }

    /// Slot indices sorted by position.
    fn temporal_slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = (0..self.slot_positions.len()).collect();
        slots.sort_unstable_by_key(|&s| self.slot_positions[s]);
        slots
    }

    /// Slots kept as context for a multi-token update: every sink plus the
    /// `window - 1` most recent tokens, in temporal order.
    fn context_slots(&self) -> Vec<usize> {
        let temporal = self.temporal_slots();
        let split = temporal
            .iter()
            .position(|&s| self.slot_positions[s] >= self.keep)
            .unwrap_or(temporal.len());
        let (sinks, rest) = temporal.split_at(split);
        let tail = rest.len().saturating_sub(self.window - 1);
        sinks.iter().chain(&rest[tail..]).copied().collect()
    }

    /// Positions of the keys the next update of `query_len` tokens returns.
    fn key_positions_after(&self, query_len: usize) -> Vec<usize> {
        if query_len == 1 {
            let mut positions = self.slot_positions.clone();
            if positions.len() < self.max_size() {
                positions.push(self.total);
            } else {
                let slot = if self.idx >= self.max_size() {
                    self.keep
                } else {
                    self.idx
                };
                positions[slot] = self.total;
            }
            positions
        } else {
            self.context_slots()
                .into_iter()
                .map(|s| self.slot_positions[s])
                .chain(self.total..self.total + query_len)
                .collect()
        }
    }

    /// Append keys/values and return the history used for attention.
    pub fn update_and_fetch(
        &mut self,
        new_keys: &Array,
        new_values: &Array,
    ) -> Result<(Array, Array)> {
        let (_, _, new_len) = check_update(new_keys, new_values)?;
        if let (Some(k), Some(v)) = (&self.keys, &self.values) {
            check_layout(k, new_keys)?;
            check_layout(v, new_values)?;
        }
        if new_len == 1 {
            self.update_in_place(new_keys, new_values)
        } else {
            self.update_concat(new_keys, new_values, new_len)
        }
    }

    fn update_in_place(&mut self, new_keys: &Array, new_values: &Array) -> Result<(Array, Array)> {
        let filled = self.slot_positions.len();
        let slot = if filled < self.max_size() {
            if filled == self.allocated {
                self.grow(new_keys, new_values)?;
            }
            filled
        } else {
            if self.idx >= self.max_size() {
                self.idx = self.keep;
            }
            trace!(
                slot = self.idx,
                evicted = self.slot_positions[self.idx],
                "rotating cache eviction"
            );
            self.idx
        };

        let (Some(k_buf), Some(v_buf)) = (self.keys.as_mut(), self.values.as_mut()) else {
            return Err(MlxError::InvariantViolation(
                "rotating cache buffers missing".into(),
            ));
        };
        let range = slot as i32..slot as i32 + 1;
        k_buf.try_index_mut((.., .., range.clone(), ..), new_keys)?;
        v_buf.try_index_mut((.., .., range, ..), new_values)?;

        if slot == filled {
            self.slot_positions.push(self.total);
        } else {
            self.slot_positions[slot] = self.total;
        }
        self.idx = slot + 1;
        self.total += 1;

        let len = self.slot_positions.len() as i32;
        Ok((
            k_buf.index((.., .., ..len, ..)),
            v_buf.index((.., .., ..len, ..)),
        ))
    }

    fn grow(&mut self, new_keys: &Array, new_values: &Array) -> Result<()> {
        let extra = self.step.min(self.max_size() - self.allocated) as i32;
        let (batch, heads) = (new_keys.dim(0), new_keys.dim(1));
        let fresh_k = ops::zeros_dtype(&[batch, heads, extra, new_keys.dim(3)], new_keys.dtype())?;
        let fresh_v =
            ops::zeros_dtype(&[batch, heads, extra, new_values.dim(3)], new_values.dtype())?;
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => {
                self.keys = Some(concatenate_axis(&[k, &fresh_k], 2)?);
                self.values = Some(concatenate_axis(&[v, &fresh_v], 2)?);
            }
            _ => {
                self.keys = Some(fresh_k);
                self.values = Some(fresh_v);
            }
        }
        self.allocated += extra as usize;
        debug!(allocated = self.allocated, max_size = self.max_size(), "rotating cache grown");
        Ok(())
    }

    fn update_concat(
        &mut self,
        new_keys: &Array,
        new_values: &Array,
        new_len: usize,
    ) -> Result<(Array, Array)> {
        let context = self.context_slots();
        let mut positions: Vec<usize> = context.iter().map(|&s| self.slot_positions[s]).collect();
        positions.extend(self.total..self.total + new_len);

        let (full_k, full_v) = match (&self.keys, &self.values) {
            (Some(k), Some(v)) if !context.is_empty() => {
                let (old_k, old_v) = gather_slots(k, v, &context)?;
                (
                    concatenate_axis(&[&old_k, new_keys], 2)?,
                    concatenate_axis(&[&old_v, new_values], 2)?,
                )
            }
            _ => (new_keys.clone(), new_values.clone()),
        };

        // Compact storage: all sinks plus the last `window` tokens.
        let split = positions
            .iter()
            .position(|&p| p >= self.keep)
            .unwrap_or(positions.len());
        let tail = split.max(positions.len().saturating_sub(self.window));
        let stored: Vec<usize> = (0..split).chain(tail..positions.len()).collect();
        if stored.len() == positions.len() {
            self.keys = Some(full_k.clone());
            self.values = Some(full_v.clone());
        } else {
            let (k, v) = gather_slots(&full_k, &full_v, &stored)?;
            self.keys = Some(k);
            self.values = Some(v);
        }

        self.slot_positions = stored.iter().map(|&i| positions[i]).collect();
        self.allocated = self.slot_positions.len();
        self.idx = self.allocated;
        self.total += new_len;
        Ok((full_k, full_v))
    }

    /// Remove the last `n` tokens.
    ///
    /// Rolling back past the live window is an error: evicted tokens cannot
    /// be restored.
    pub fn trim(&mut self, n: usize) -> Result<usize> {
        let limit = self.trimmable();
        if n > limit {
            return Err(MlxError::InvalidArgument(format!(
                "cannot trim {n} tokens from rotating cache, live window holds {limit}"
            )));
        }
        if n == 0 {
            return Ok(0);
        }

        let mut temporal = self.temporal_slots();
        temporal.truncate(temporal.len() - n);
        self.slot_positions = temporal.iter().map(|&s| self.slot_positions[s]).collect();
        if temporal.is_empty() {
            self.keys = None;
            self.values = None;
        } else if let (Some(k), Some(v)) = (&self.keys, &self.values) {
            let (k, v) = gather_slots(k, v, &temporal)?;
            self.keys = Some(k);
            self.values = Some(v);
        }
        self.allocated = self.slot_positions.len();
        self.idx = self.allocated;
        self.total -= n;
        Ok(n)
    }

    /// Mask for the next update of `query_len` tokens.
    ///
    /// The window defaults to the cache's own window; sinks stay visible.
    pub fn make_mask(&self, query_len: usize, window: Option<usize>) -> Result<AttentionMask> {
        if query_len == 0 {
            return Err(MlxError::InvalidArgument("query_len must be positive".into()));
        }
        if window == Some(0) {
            return Err(MlxError::InvalidArgument("window must be positive".into()));
        }
        let window = window.map_or(self.window, |w| w.min(self.window));
        let queries: Vec<usize> = (self.total..self.total + query_len).collect();
        let keys = self.key_positions_after(query_len);
        let (mask, windowed) = mask_from_positions(&queries, &keys, Some(window), self.keep);
        Ok(match (query_len, windowed) {
            (1, false) => AttentionMask::None,
            (_, true) => AttentionMask::SlidingWindow(mask),
            (_, false) => AttentionMask::Causal(mask),
        })
    }

    /// Drop all history and free buffers.
    pub fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.slot_positions.clear();
        self.idx = 0;
        self.total = 0;
        self.allocated = 0;
    }

    /// Bytes held by the buffers.
    pub fn memory_usage(&self) -> usize {
        self.keys.as_ref().map_or(0, Array::nbytes) + self.values.as_ref().map_or(0, Array::nbytes)
    }
}

fn gather_slots(keys: &Array, values: &Array, slots: &[usize]) -> Result<(Array, Array)> {
    let idx: Vec<i32> = slots.iter().map(|&s| s as i32).collect();
    let idx = Array::from_slice(&idx, &[idx.len() as i32]);
    Ok((keys.take_axis(&idx, 2)?, values.take_axis(&idx, 2)?))
}
