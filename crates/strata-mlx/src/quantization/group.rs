//! Affine group quantization.
//!
//! Each row is split into groups of `group_size` consecutive elements. A group
//! stores one scale and one bias (the group minimum) and every element is
//! rounded to `bits` bits:
//!
//! ```text
//! scale = (max - min) / (2^bits - 1)
//! q     = round((x - min) / scale)
//! x'    = q * scale + min
//! ```
//!
//! Rounding to the nearest level bounds the reconstruction error of every
//! element by `scale / 2` for its group. A group with a single distinct value
//! uses `scale = 1` and reconstructs exactly.
//!
//! Quantized values are packed little-end first into `u32` words,
//! `32 / bits` values per word. Rows whose length is not a multiple of the
//! group size get a shorter final group, which is equivalent to zero padding
//! the row without storing the padding.

use crate::error::{MlxError, Result};
use mlx_rs::Array;

/// Configuration for group quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupQuantConfig {
    /// Number of bits per value.
    pub bits: u8,
    /// Number of consecutive values sharing a scale and bias.
    pub group_size: usize,
}

impl GroupQuantConfig {
    /// Create a new group quantization config.
    pub fn new(bits: u8, group_size: usize) -> Result<Self> {
        if !strata_core::SUPPORTED_CACHE_BITS.contains(&bits) {
            return Err(MlxError::InvalidConfig(format!(
                "unsupported bit width {bits}"
            )));
        }
        if group_size == 0 {
            return Err(MlxError::InvalidConfig("group_size must be positive".into()));
        }
        Ok(Self { bits, group_size })
    }

    /// Number of quantization levels.
    pub fn n_levels(&self) -> u32 {
        1u32 << self.bits
    }

    /// Values packed per u32.
    pub fn elements_per_u32(&self) -> usize {
        32 / self.bits as usize
    }

    /// Packed words needed for a row of `cols` values.
    pub fn packed_cols(&self, cols: usize) -> usize {
        (cols + self.elements_per_u32() - 1) / self.elements_per_u32()
    }

    /// Groups needed for a row of `cols` values.
    pub fn groups(&self, cols: usize) -> usize {
        (cols + self.group_size - 1) / self.group_size
    }
}

/// Row-major group-quantized data.
#[derive(Debug, Clone, Default)]
pub struct GroupQuantizedRows {
    /// Packed values, `packed_cols` words per row.
    pub packed: Vec<u32>,
    /// Per-group scales, `groups` per row.
    pub scales: Vec<f32>,
    /// Per-group biases (group minimum), `groups` per row.
    pub biases: Vec<f32>,
}

impl GroupQuantizedRows {
    /// Bytes held by the quantized representation.
    pub fn memory_usage(&self) -> usize {
        (self.packed.len() + self.scales.len() + self.biases.len()) * 4
    }
}

/// Group quantizer.
#[derive(Debug, Clone)]
pub struct GroupQuantizer {
    config: GroupQuantConfig,
}

impl GroupQuantizer {
    /// Create a new group quantizer.
    pub fn new(config: GroupQuantConfig) -> Self {
        Self { config }
    }

    /// Get the config.
    pub fn config(&self) -> &GroupQuantConfig {
        &self.config
    }

    /// Quantize `data` (rows of `cols` values) and append to `out`.
    pub fn quantize_into(&self, data: &[f32], cols: usize, out: &mut GroupQuantizedRows) {
        let group_size = self.config.group_size;
        let bits = self.config.bits as usize;
        let max_level = (self.config.n_levels() - 1) as f32;
        let el_per_int = self.config.elements_per_u32();
        let packed_cols = self.config.packed_cols(cols);
        if cols == 0 {
            return;
        }

        for row in data.chunks_exact(cols) {
            let word_base = out.packed.len();
            out.packed.resize(word_base + packed_cols, 0);

            for (g, group) in row.chunks(group_size).enumerate() {
                let (min_val, max_val) = group
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                let range = max_val - min_val;
                let scale = if range > 0.0 { range / max_level } else { 1.0 };
                out.scales.push(scale);
                out.biases.push(min_val);

                for (j, &val) in group.iter().enumerate() {
                    let i = g * group_size + j;
                    let q = ((val - min_val) / scale).round().clamp(0.0, max_level) as u32;
                    let bit_offset = (i % el_per_int) * bits;
                    out.packed[word_base + i / el_per_int] |= q << bit_offset;
                }
            }
        }
    }

    /// Dequantize `rows` rows starting at `first_row` into `out`.
    pub fn dequantize_into(
        &self,
        quantized: &GroupQuantizedRows,
        cols: usize,
        first_row: usize,
        rows: usize,
        out: &mut Vec<f32>,
    ) {
        let group_size = self.config.group_size;
        let bits = self.config.bits as usize;
        let el_per_int = self.config.elements_per_u32();
        let packed_cols = self.config.packed_cols(cols);
        let groups = self.config.groups(cols);
        let mask = (1u32 << bits) - 1;

        out.reserve(rows * cols);
        for row in first_row..first_row + rows {
            let words = &quantized.packed[row * packed_cols..(row + 1) * packed_cols];
            let scales = &quantized.scales[row * groups..(row + 1) * groups];
            let biases = &quantized.biases[row * groups..(row + 1) * groups];
            for i in 0..cols {
                let g = i / group_size;
                let q = (words[i / el_per_int] >> ((i % el_per_int) * bits)) & mask;
                out.push(q as f32 * scales[g] + biases[g]);
            }
        }
    }

    /// Quantize the rows of an array along its last axis into device arrays
    /// that keep the leading shape of `x`.
    pub fn quantize_array(&self, x: &Array) -> Result<QuantizedArrays> {
        let cols = last_dim(x)?;
        if cols == 0 {
            return Err(MlxError::InvalidArgument("cannot quantize empty rows".into()));
        }
        let x = x.as_type::<f32>()?;
        x.eval()?;
        let mut rows = GroupQuantizedRows::default();
        self.quantize_into(x.as_slice::<f32>(), cols, &mut rows);

        let lead = &x.shape()[..x.ndim() - 1];
        let with_last = |n: usize| -> Vec<i32> {
            lead.iter().copied().chain(std::iter::once(n as i32)).collect()
        };
        let groups = with_last(self.config.groups(cols));
        Ok(QuantizedArrays {
            packed: Array::from_slice(&rows.packed, &with_last(self.config.packed_cols(cols))),
            scales: Array::from_slice(&rows.scales, &groups),
            biases: Array::from_slice(&rows.biases, &groups),
        })
    }

    /// Tables for dequantizing rows of `cols` values on the device.
    pub fn unpacker(&self, cols: usize) -> Result<Unpacker> {
        if cols == 0 {
            return Err(MlxError::InvalidArgument("cannot unpack empty rows".into()));
        }
        let bits = self.config.bits as u32;
        let el_per_int = self.config.elements_per_u32();
        let word_index: Vec<i32> = (0..cols).map(|i| (i / el_per_int) as i32).collect();
        let divisor: Vec<u32> = (0..cols)
            .map(|i| 1u32 << ((i % el_per_int) as u32 * bits))
            .collect();
        let group_index: Vec<i32> = (0..cols)
            .map(|i| (i / self.config.group_size) as i32)
            .collect();
        let n = cols as i32;
        Ok(Unpacker {
            cols,
            word_index: Array::from_slice(&word_index, &[n]),
            divisor: Array::from_slice(&divisor, &[n]),
            levels: Array::from_slice(&[self.config.n_levels()], &[1]),
            group_index: Array::from_slice(&group_index, &[n]),
        })
    }

    /// Reconstruct float32 values from [`Self::quantize_array`] output.
    pub fn dequantize_array(&self, quantized: &QuantizedArrays, cols: usize) -> Result<Array> {
        self.unpacker(cols)?.dequantize(quantized)
    }
}

/// Group-quantized rows held on the device.
///
/// All three arrays share the leading dimensions of the quantized tensor;
/// the last axis holds `packed_cols` words or `groups` scales/biases.
#[derive(Debug, Clone)]
pub struct QuantizedArrays {
    /// Packed codes, uint32.
    pub packed: Array,
    /// Per-group scales, float32.
    pub scales: Array,
    /// Per-group biases, float32.
    pub biases: Array,
}

/// Gather tables that unpack codes with integer division on the device.
#[derive(Debug, Clone)]
pub struct Unpacker {
    cols: usize,
    word_index: Array,
    divisor: Array,
    levels: Array,
    group_index: Array,
}

impl Unpacker {
    /// Row length this unpacker produces.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Dequantize `[..., packed_cols]` words to `[..., cols]` float32 values.
    pub fn dequantize(&self, quantized: &QuantizedArrays) -> Result<Array> {
        let words = quantized.packed.take_axis(&self.word_index, -1)?;
        let codes = words
            .floor_divide(&self.divisor)?
            .remainder(&self.levels)?
            .as_type::<f32>()?;
        let scales = quantized.scales.take_axis(&self.group_index, -1)?;
        let biases = quantized.biases.take_axis(&self.group_index, -1)?;
        Ok(codes.multiply(&scales)?.add(&biases)?)
    }
}

fn last_dim(x: &Array) -> Result<usize> {
    if x.ndim() == 0 {
        return Err(MlxError::InvalidArgument("cannot quantize a scalar".into()));
    }
    Ok(x.dim(-1) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_error_within_half_scale(bits: u8, group_size: usize, cols: usize, data: &[f32]) {
        let config = GroupQuantConfig::new(bits, group_size).unwrap();
        let quantizer = GroupQuantizer::new(config);
        let mut rows = GroupQuantizedRows::default();
        quantizer.quantize_into(data, cols, &mut rows);

        let n_rows = data.len() / cols;
        let mut restored = Vec::new();
        quantizer.dequantize_into(&rows, cols, 0, n_rows, &mut restored);
        assert_eq!(restored.len(), data.len());

        let groups = config.groups(cols);
        for (idx, (a, b)) in data.iter().zip(restored.iter()).enumerate() {
            let row = idx / cols;
            let g = (idx % cols) / group_size;
            let scale = rows.scales[row * groups + g];
            assert!(
                (a - b).abs() <= scale / 2.0 + 1e-5,
                "element {idx}: {a} vs {b}, scale {scale}"
            );
        }
    }

    #[test]
    fn test_config_rejects_bad_bits() {
        assert!(GroupQuantConfig::new(7, 64).is_err());
        assert!(GroupQuantConfig::new(4, 0).is_err());
        let config = GroupQuantConfig::new(4, 64).unwrap();
        assert_eq!(config.n_levels(), 16);
        assert_eq!(config.elements_per_u32(), 8);
        assert_eq!(config.packed_cols(64), 8);
        assert_eq!(config.groups(100), 2);
    }

    #[test]
    fn test_round_trip_bound_all_widths() {
        let data: Vec<f32> = (0..256).map(|i| ((i * 37 % 101) as f32 - 50.0) / 13.0).collect();
        for bits in strata_core::SUPPORTED_CACHE_BITS {
            max_abs_error_within_half_scale(bits, 32, 64, &data);
        }
    }

    #[test]
    fn test_partial_final_group() {
        let data: Vec<f32> = (0..3 * 40).map(|i| (i as f32).sin()).collect();
        max_abs_error_within_half_scale(4, 32, 40, &data);
    }

    #[test]
    fn test_constant_group_is_exact() {
        let config = GroupQuantConfig::new(2, 8).unwrap();
        let quantizer = GroupQuantizer::new(config);
        let data = vec![0.25f32; 8];
        let mut rows = GroupQuantizedRows::default();
        quantizer.quantize_into(&data, 8, &mut rows);
        let mut restored = Vec::new();
        quantizer.dequantize_into(&rows, 8, 0, 1, &mut restored);
        assert_eq!(restored, data);
    }

    #[test]
    fn test_array_round_trip_8bit() {
        let config = GroupQuantConfig::new(8, 64).unwrap();
        let quantizer = GroupQuantizer::new(config);
        let x = mlx_rs::random::normal::<f32>(&[2, 4, 3, 64], None, None, None).unwrap();
        let q = quantizer.quantize_array(&x).unwrap();
        assert_eq!(q.packed.shape(), &[2, 4, 3, 16]);
        assert_eq!(q.scales.shape(), &[2, 4, 3, 1]);
        let restored = quantizer.dequantize_array(&q, 64).unwrap();
        assert_eq!(restored.shape(), x.shape());

        restored.eval().unwrap();
        x.eval().unwrap();
        q.scales.eval().unwrap();
        let max_diff = restored
            .as_slice::<f32>()
            .iter()
            .zip(x.as_slice::<f32>())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        let max_scale = q.scales.as_slice::<f32>().iter().cloned().fold(0.0f32, f32::max);
        assert!(max_diff <= max_scale / 2.0 + 1e-5, "max diff {max_diff}");
    }

    #[test]
    fn test_device_unpack_matches_host_all_widths() {
        let cols = 40;
        let data: Vec<f32> = (0..3 * cols).map(|i| ((i * 29 % 71) as f32 - 35.0) / 9.0).collect();
        let x = Array::from_slice(&data, &[3, cols as i32]);
        for bits in strata_core::SUPPORTED_CACHE_BITS {
            let quantizer = GroupQuantizer::new(GroupQuantConfig::new(bits, 16).unwrap());
            let mut rows = GroupQuantizedRows::default();
            quantizer.quantize_into(&data, cols, &mut rows);
            let mut expected = Vec::new();
            quantizer.dequantize_into(&rows, cols, 0, 3, &mut expected);

            let device = quantizer
                .dequantize_array(&quantizer.quantize_array(&x).unwrap(), cols)
                .unwrap();
            device.eval().unwrap();
            for (a, b) in device.as_slice::<f32>().iter().zip(&expected) {
                assert!((a - b).abs() < 1e-5, "{bits} bits: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_empty_rows_rejected() {
        let quantizer = GroupQuantizer::new(GroupQuantConfig::new(4, 16).unwrap());
        let x = Array::zeros::<f32>(&[2, 0]).unwrap();
        assert!(matches!(
            quantizer.quantize_array(&x),
            Err(MlxError::InvalidArgument(_))
        ));
        assert!(quantizer.unpacker(0).is_err());
    }
}
