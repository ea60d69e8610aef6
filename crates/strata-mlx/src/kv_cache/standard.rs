//! Growing cache that keeps every token.

use super::{check_layout, check_update};
use crate::error::{MlxError, Result};
use mlx_rs::{
    ops,
    ops::concatenate_axis,
    ops::indexing::{IndexOp, TryIndexMutOp},
    Array,
};
use tracing::debug;

/// Cache that retains the full history.
///
/// Buffers are `[B, heads, capacity, head_dim]`; the first `offset` slots
/// along axis 2 hold valid tokens. When an update would overflow, the buffer
/// grows by `max(step, new_len)` slots and the valid region is copied over.
#[derive(Debug, Clone)]
pub struct StandardCache {
    keys: Option<Array>,
    values: Option<Array>,
    offset: usize,
    capacity: usize,
    step: usize,
    max_capacity: Option<usize>,
    reallocations: usize,
}

impl StandardCache {
    /// Create an empty cache.
    pub fn new(step: usize, max_capacity: Option<usize>) -> Self {
        Self {
            keys: None,
            values: None,
            offset: 0,
            capacity: 0,
            step: step.max(1),
            max_capacity,
            reallocations: 0,
        }
    }

    /// Number of valid tokens.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Allocated slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffer reallocations so far.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Append keys/values and return views of the valid history.
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

        let prev = self.offset;
        if prev + new_len > self.capacity {
            self.grow(new_keys, new_values, new_len)?;
        }
        self.offset = prev + new_len;

        let (Some(k_buf), Some(v_buf)) = (self.keys.as_mut(), self.values.as_mut()) else {
            return Err(MlxError::InvariantViolation(
                "cache buffers missing after growth".into(),
            ));
        };
        let slots = prev as i32..self.offset as i32;
        k_buf.try_index_mut((.., .., slots.clone(), ..), new_keys)?;
        v_buf.try_index_mut((.., .., slots, ..), new_values)?;

        let valid = ..self.offset as i32;
        Ok((
            k_buf.index((.., .., valid, ..)),
            v_buf.index((.., .., valid, ..)),
        ))
    }

    fn grow(&mut self, new_keys: &Array, new_values: &Array, new_len: usize) -> Result<()> {
        let new_capacity = self.capacity + self.step.max(new_len);
        if let Some(max) = self.max_capacity {
            if self.offset + new_len > max {
                return Err(MlxError::Allocation(format!(
                    "cache would hold {} tokens, max_capacity is {max}",
                    self.offset + new_len
                )));
            }
        }
        let new_capacity = self.max_capacity.map_or(new_capacity, |m| new_capacity.min(m));
        let extra = (new_capacity - self.offset) as i32;

        let (batch, heads) = (new_keys.dim(0), new_keys.dim(1));
        let fresh_k = ops::zeros_dtype(&[batch, heads, extra, new_keys.dim(3)], new_keys.dtype())?;
        let fresh_v =
            ops::zeros_dtype(&[batch, heads, extra, new_values.dim(3)], new_values.dtype())?;

        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => {
                let valid = ..self.offset as i32;
                let k = k.index((.., .., valid, ..));
                let v = v.index((.., .., valid, ..));
                self.keys = Some(concatenate_axis(&[&k, &fresh_k], 2)?);
                self.values = Some(concatenate_axis(&[&v, &fresh_v], 2)?);
            }
            _ => {
                self.keys = Some(fresh_k);
                self.values = Some(fresh_v);
            }
        }

        debug!(
            old_capacity = self.capacity,
            new_capacity, offset = self.offset, "kv cache grown"
        );
        self.capacity = new_capacity;
        self.reallocations += 1;
        Ok(())
    }

    /// Remove the last `n` tokens.
    pub fn trim(&mut self, n: usize) -> Result<usize> {
        if n > self.offset {
            return Err(MlxError::InvalidArgument(format!(
                "cannot trim {n} tokens, only {} retained",
                self.offset
            )));
        }
        self.offset -= n;
        Ok(n)
    }

    /// Drop all history and free buffers.
    pub fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.offset = 0;
        self.capacity = 0;
    }

    /// Bytes held by the buffers.
    pub fn memory_usage(&self) -> usize {
        self.keys.as_ref().map_or(0, Array::nbytes) + self.values.as_ref().map_or(0, Array::nbytes)
    }
}
