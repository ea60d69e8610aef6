//! Group-quantized cache.
//!
//! Packed codes, scales and biases live in device buffers laid out like the
//! float caches, `[B, heads, capacity, *]`. Only the incoming chunk is
//! quantized per update; reads unpack the retained slots on the device and
//! return them in the dtype the keys/values arrived with.

use super::check_update;
use crate::error::{MlxError, Result};
use crate::quantization::{GroupQuantConfig, GroupQuantizer, QuantizedArrays, Unpacker};
use mlx_rs::{
    ops,
    ops::concatenate_axis,
    ops::indexing::{IndexOp, TryIndexMutOp},
    Array, Dtype,
};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Layout {
    batch: i32,
    heads: i32,
    key_dim: i32,
    value_dim: i32,
    dtype: Dtype,
}

/// Device buffers for one of keys or values.
#[derive(Debug, Clone)]
struct Store {
    buffers: QuantizedArrays,
    unpacker: Unpacker,
}

impl Store {
    fn empty(quantizer: &GroupQuantizer, layout: &Layout, cols: i32) -> Result<Self> {
        Ok(Self {
            buffers: fresh(quantizer.config(), layout, cols, 0)?,
            unpacker: quantizer.unpacker(cols as usize)?,
        })
    }

    fn grow(
        &mut self,
        config: &GroupQuantConfig,
        layout: &Layout,
        valid: i32,
        extra: i32,
    ) -> Result<()> {
        let fresh = fresh(config, layout, self.unpacker.cols() as i32, extra)?;
        let keep = |buf: &Array, more: &Array| -> Result<Array> {
            let buf = buf.index((.., .., ..valid, ..));
            Ok(concatenate_axis(&[&buf, more], 2)?)
        };
        self.buffers = QuantizedArrays {
            packed: keep(&self.buffers.packed, &fresh.packed)?,
            scales: keep(&self.buffers.scales, &fresh.scales)?,
            biases: keep(&self.buffers.biases, &fresh.biases)?,
        };
        Ok(())
    }

    fn write(&mut self, start: i32, chunk: &QuantizedArrays) -> Result<()> {
        let slots = start..start + chunk.packed.dim(2);
        self.buffers
            .packed
            .try_index_mut((.., .., slots.clone(), ..), &chunk.packed)?;
        self.buffers
            .scales
            .try_index_mut((.., .., slots.clone(), ..), &chunk.scales)?;
        self.buffers
            .biases
            .try_index_mut((.., .., slots, ..), &chunk.biases)?;
        Ok(())
    }

    fn retained(&self, offset: i32) -> QuantizedArrays {
        let valid = ..offset;
        QuantizedArrays {
            packed: self.buffers.packed.index((.., .., valid, ..)),
            scales: self.buffers.scales.index((.., .., valid, ..)),
            biases: self.buffers.biases.index((.., .., valid, ..)),
        }
    }

    fn nbytes(&self) -> usize {
        self.buffers.packed.nbytes() + self.buffers.scales.nbytes() + self.buffers.biases.nbytes()
    }
}

/// Zeroed buffers with `slots` token slots.
fn fresh(
    config: &GroupQuantConfig,
    layout: &Layout,
    cols: i32,
    slots: i32,
) -> Result<QuantizedArrays> {
    let (b, h) = (layout.batch, layout.heads);
    let packed_cols = config.packed_cols(cols as usize) as i32;
    let groups = config.groups(cols as usize) as i32;
    Ok(QuantizedArrays {
        packed: ops::zeros_dtype(&[b, h, slots, packed_cols], Dtype::Uint32)?,
        scales: ops::zeros_dtype(&[b, h, slots, groups], Dtype::Float32)?,
        biases: ops::zeros_dtype(&[b, h, slots, groups], Dtype::Float32)?,
    })
}

/// Cache storing keys/values as group-quantized codes.
#[derive(Debug, Clone)]
pub struct QuantizedCache {
    quantizer: GroupQuantizer,
    keys: Option<Store>,
    values: Option<Store>,
    layout: Option<Layout>,
    offset: usize,
    capacity: usize,
    step: usize,
    max_capacity: Option<usize>,
    reallocations: usize,
}

impl QuantizedCache {
    /// Create an empty cache quantizing to `bits` with groups of `group_size`.
    pub fn new(
        bits: u8,
        group_size: usize,
        step: usize,
        max_capacity: Option<usize>,
    ) -> Result<Self> {
        let config = GroupQuantConfig::new(bits, group_size)?;
        Ok(Self {
            quantizer: GroupQuantizer::new(config),
            keys: None,
            values: None,
            layout: None,
            offset: 0,
            capacity: 0,
            step: step.max(1),
            max_capacity,
            reallocations: 0,
        })
    }

    /// Quantization parameters.
    pub fn config(&self) -> &GroupQuantConfig {
        self.quantizer.config()
    }

    /// Number of valid tokens.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Token slots reserved.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffer reallocations so far.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Quantize and append keys/values, returning the dequantized history.
    pub fn update_and_fetch(
        &mut self,
        new_keys: &Array,
        new_values: &Array,
    ) -> Result<(Array, Array)> {
        let (batch, heads, new_len) = check_update(new_keys, new_values)?;
        let incoming = Layout {
            batch,
            heads,
            key_dim: new_keys.dim(3),
            value_dim: new_values.dim(3),
            dtype: new_keys.dtype(),
        };
        let layout = match self.layout {
            Some(layout) => {
                if (layout.batch, layout.heads, layout.key_dim, layout.value_dim)
                    != (batch, heads, incoming.key_dim, incoming.value_dim)
                {
                    return Err(MlxError::shape(
                        &[layout.batch, layout.heads, new_len as i32, layout.key_dim],
                        new_keys.shape(),
                    ));
                }
                layout
            }
            None => incoming,
        };

        // Quantized up front: a failed update leaves the cache untouched.
        let key_chunk = self.quantizer.quantize_array(new_keys)?;
        let value_chunk = self.quantizer.quantize_array(new_values)?;

        if self.keys.is_none() || self.values.is_none() {
            self.keys = Some(Store::empty(&self.quantizer, &layout, layout.key_dim)?);
            self.values = Some(Store::empty(&self.quantizer, &layout, layout.value_dim)?);
            self.layout = Some(layout);
        }
        if self.offset + new_len > self.capacity {
            self.grow(&layout, new_len)?;
        }

        let (Some(keys), Some(values)) = (self.keys.as_mut(), self.values.as_mut()) else {
            return Err(MlxError::InvariantViolation(
                "quantized buffers missing after growth".into(),
            ));
        };
        let start = self.offset as i32;
        keys.write(start, &key_chunk)?;
        values.write(start, &value_chunk)?;
        self.offset += new_len;

        let valid = self.offset as i32;
        let restored_keys = keys.unpacker.dequantize(&keys.retained(valid))?;
        let restored_values = values.unpacker.dequantize(&values.retained(valid))?;
        Ok((
            restored_keys.as_dtype(layout.dtype)?,
            restored_values.as_dtype(layout.dtype)?,
        ))
    }

    fn grow(&mut self, layout: &Layout, new_len: usize) -> Result<()> {
        if let Some(max) = self.max_capacity {
            if self.offset + new_len > max {
                return Err(MlxError::Allocation(format!(
                    "quantized cache would hold {} tokens, max_capacity is {max}",
                    self.offset + new_len
                )));
            }
        }
        let new_capacity = self.capacity + self.step.max(new_len);
        let new_capacity = self.max_capacity.map_or(new_capacity, |m| new_capacity.min(m));
        let extra = (new_capacity - self.offset) as i32;

        let config = *self.quantizer.config();
        let valid = self.offset as i32;
        for store in [self.keys.as_mut(), self.values.as_mut()].into_iter().flatten() {
            store.grow(&config, layout, valid, extra)?;
        }

        debug!(
            old_capacity = self.capacity,
            new_capacity,
            bits = config.bits,
            "quantized kv cache grown"
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

    /// Quantized buffers of the retained tokens, `[B, heads, offset, *]`.
    pub fn state(&self) -> Option<(QuantizedArrays, QuantizedArrays)> {
        let (keys, values) = (self.keys.as_ref()?, self.values.as_ref()?);
        let valid = self.offset as i32;
        Some((keys.retained(valid), values.retained(valid)))
    }

    /// Drop all history and free buffers.
    pub fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.layout = None;
        self.offset = 0;
        self.capacity = 0;
    }

    /// Bytes held by the quantized buffers.
    pub fn memory_usage(&self) -> usize {
        self.keys.as_ref().map_or(0, Store::nbytes) + self.values.as_ref().map_or(0, Store::nbytes)
    }
}
