//! Rotary Position Embedding (RoPE) with extended context support.
//!
//! The frequency table is computed once when the encoder is built and kept on
//! the device; applying it is a pure function of `(x, offset)` that runs
//! through `mlx_rs::fast::rope` with custom frequencies.
//!
//! ## Variants
//!
//! | Scaling | Effect on frequencies |
//! |---------|-----------------------|
//! | none | `inv_freq[i] = base^(-2i/d)` |
//! | Linear | positions divided by `factor` |
//! | Llama3 | long wavelengths divided by `factor`, short ones kept, smooth ramp between |
//! | YaRN | NTK-by-parts blend between interpolated and extrapolated frequencies, output scaled by `mscale` |
//! | LongRoPE | per-frequency short/long factor arrays, chosen once per call by sequence length |
//!
//! ## YaRN
//!
//! Dimensions rotating fewer than `beta_slow` times over the original context
//! are fully interpolated; those rotating more than `beta_fast` times keep
//! their original frequency; a linear ramp blends the band in between. The
//! rotated features are multiplied by
//! `mscale(factor, mscale) / mscale(factor, mscale_all_dim)` where
//! `mscale(s, m) = 0.1 * m * ln(s) + 1` for `s > 1`.

use crate::error::{MlxError, Result};
use mlx_rs::{ops::concatenate_axis, Array};
use std::f32::consts::PI;
use strata_core::{RopeConfig, RopeScaling};

/// Host inverse frequencies plus the device frequency array passed to
/// `fast::rope` (MLX expects periods, `1 / inv_freq`).
#[derive(Debug, Clone)]
struct FrequencyTable {
    inv_freq: Vec<f32>,
    freqs: Array,
}

impl FrequencyTable {
    fn new(inv_freq: Vec<f32>) -> Self {
        let periods: Vec<f32> = inv_freq.iter().map(|f| 1.0 / f).collect();
        let freqs = Array::from_slice(&periods, &[periods.len() as i32]);
        Self { inv_freq, freqs }
    }
}

/// Frequency tables of one encoder.
#[derive(Debug, Clone)]
enum Frequencies {
    /// One table for every position.
    Fixed { table: FrequencyTable, mscale: f32 },
    /// Short/long tables picked by total sequence length.
    Dual {
        short: FrequencyTable,
        long: FrequencyTable,
        short_mscale: f32,
        long_mscale: f32,
        original_max: usize,
    },
}

/// Precomputed rotary encoder.
#[derive(Debug, Clone)]
pub struct RotaryEncoder {
    dims: usize,
    traditional: bool,
    position_scale: f32,
    frequencies: Frequencies,
}

impl RotaryEncoder {
    /// Build the frequency table for `config`.
    pub fn new(config: &RopeConfig) -> Result<Self> {
        config.validate()?;
        let dims = config.dims;
        let base_inv = base_inv_freq(config.base, dims);

        let mut position_scale = 1.0;
        let frequencies = match &config.scaling {
            None => Frequencies::Fixed {
                table: FrequencyTable::new(base_inv),
                mscale: 1.0,
            },
            Some(RopeScaling::Linear { factor }) => {
                position_scale = 1.0 / factor;
                Frequencies::Fixed {
                    table: FrequencyTable::new(base_inv),
                    mscale: 1.0,
                }
            }
            Some(RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            }) => Frequencies::Fixed {
                table: FrequencyTable::new(llama3_inv_freq(
                    &base_inv,
                    *factor,
                    *low_freq_factor,
                    *high_freq_factor,
                    *original_max_position_embeddings as f32,
                )),
                mscale: 1.0,
            },
            Some(RopeScaling::Yarn {
                factor,
                original_max_position_embeddings,
                beta_fast,
                beta_slow,
                mscale,
                mscale_all_dim,
            }) => Frequencies::Fixed {
                table: FrequencyTable::new(yarn_inv_freq(
                    config.base,
                    dims,
                    *factor,
                    *original_max_position_embeddings as f32,
                    *beta_fast,
                    *beta_slow,
                )),
                mscale: yarn_get_mscale(*factor, *mscale) / yarn_get_mscale(*factor, *mscale_all_dim),
            },
            Some(RopeScaling::LongRope {
                short_factor,
                long_factor,
                original_max_position_embeddings,
                short_mscale,
                long_mscale,
            }) => {
                let original_max = *original_max_position_embeddings;
                let ratio = config.max_position_embeddings as f32 / original_max as f32;
                let default_mscale = if ratio > 1.0 {
                    (1.0 + ratio.ln() / (original_max as f32).ln()).sqrt()
                } else {
                    1.0
                };
                let rescale = |factors: &[f32]| -> FrequencyTable {
                    FrequencyTable::new(base_inv.iter().zip(factors).map(|(f, s)| f / s).collect())
                };
                Frequencies::Dual {
                    short: rescale(short_factor),
                    long: rescale(long_factor),
                    short_mscale: short_mscale.unwrap_or(default_mscale),
                    long_mscale: long_mscale.unwrap_or(default_mscale),
                    original_max,
                }
            }
        };

        Ok(Self {
            dims,
            traditional: config.traditional,
            position_scale,
            frequencies,
        })
    }

    /// Number of rotated features.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Whether pairs are interleaved rather than split in halves.
    pub fn traditional(&self) -> bool {
        self.traditional
    }

    /// Multiplier applied to positions before rotation.
    pub fn position_scale(&self) -> f32 {
        self.position_scale
    }

    fn select(&self, offset: usize, seq_len: usize) -> (&FrequencyTable, f32) {
        match &self.frequencies {
            Frequencies::Fixed { table, mscale } => (table, *mscale),
            Frequencies::Dual {
                short,
                long,
                short_mscale,
                long_mscale,
                original_max,
            } => {
                if offset + seq_len > *original_max {
                    (long, *long_mscale)
                } else {
                    (short, *short_mscale)
                }
            }
        }
    }

    /// Inverse frequencies and magnitude scale used for a call of `seq_len`
    /// tokens starting at `offset`.
    pub fn inv_freq(&self, offset: usize, seq_len: usize) -> (&[f32], f32) {
        let (table, mscale) = self.select(offset, seq_len);
        (&table.inv_freq, mscale)
    }

    /// Rotate `x` (`[B, heads, seq, head_dim]`) for positions starting at `offset`.
    pub fn apply(&self, x: &Array, offset: usize) -> Result<Array> {
        self.rotate(x, offset, false)
    }

    /// Undo [`Self::apply`] for the same `offset`.
    pub fn apply_inverse(&self, x: &Array, offset: usize) -> Result<Array> {
        self.rotate(x, offset, true)
    }

    fn rotate(&self, x: &Array, offset: usize, inverse: bool) -> Result<Array> {
        if x.ndim() != 4 {
            return Err(MlxError::InvariantViolation(format!(
                "rope expects [B, heads, seq, head_dim], got rank {}",
                x.ndim()
            )));
        }
        let head_dim = x.dim(3);
        let dims = self.dims as i32;
        if head_dim < dims {
            return Err(MlxError::shape(&[x.dim(0), x.dim(1), x.dim(2), dims], x.shape()));
        }
        let start = i32::try_from(offset).map_err(|_| {
            MlxError::InvalidArgument(format!("rope offset {offset} does not fit in i32"))
        })?;

        let (table, mscale) = self.select(offset, x.dim(2) as usize);
        // A negated position scale rotates by the opposite angle.
        let scale = if inverse {
            -self.position_scale
        } else {
            self.position_scale
        };
        let out =
            mlx_rs::fast::rope(x, dims, self.traditional, None, scale, start, &table.freqs)?;
        if mscale == 1.0 {
            return Ok(out);
        }

        let factor = Array::from_f32(if inverse { 1.0 / mscale } else { mscale });
        let out = if dims == head_dim {
            out.multiply(&factor)?
        } else {
            let parts = out.split_axis(&[dims], -1)?;
            concatenate_axis(&[parts[0].multiply(&factor)?, parts[1].clone()], -1)?
        };
        Ok(out.as_dtype(x.dtype())?)
    }
}

fn base_inv_freq(base: f32, dims: usize) -> Vec<f32> {
    (0..dims / 2)
        .map(|i| base.powf(-(2 * i) as f32 / dims as f32))
        .collect()
}

fn llama3_inv_freq(
    base_inv: &[f32],
    factor: f32,
    low_freq_factor: f32,
    high_freq_factor: f32,
    original_max: f32,
) -> Vec<f32> {
    let low_freq_wavelen = original_max / low_freq_factor;
    let high_freq_wavelen = original_max / high_freq_factor;
    base_inv
        .iter()
        .map(|&inv| {
            let wavelen = 2.0 * PI / inv;
            if wavelen > low_freq_wavelen {
                inv / factor
            } else if wavelen < high_freq_wavelen {
                inv
            } else {
                let smooth = (original_max / wavelen - low_freq_factor)
                    / (high_freq_factor - low_freq_factor);
                (1.0 - smooth) * inv / factor + smooth * inv
            }
        })
        .collect()
}

fn yarn_correction_dim(dims: usize, base: f32, original_max: f32, rotations: f32) -> f32 {
    dims as f32 * (original_max / (rotations * 2.0 * PI)).ln() / (2.0 * base.ln())
}

fn yarn_inv_freq(
    base: f32,
    dims: usize,
    factor: f32,
    original_max: f32,
    beta_fast: f32,
    beta_slow: f32,
) -> Vec<f32> {
    let max_dim = (dims - 1) as f32;
    let low = yarn_correction_dim(dims, base, original_max, beta_fast)
        .floor()
        .max(0.0);
    let high = yarn_correction_dim(dims, base, original_max, beta_slow)
        .ceil()
        .min(max_dim);
    let high = if low == high { high + 0.001 } else { high };

    (0..dims / 2)
        .map(|i| {
            let ramp = ((i as f32 - low) / (high - low)).clamp(0.0, 1.0);
            let mask = 1.0 - ramp;
            let freq_extra = base.powf((2 * i) as f32 / dims as f32);
            let freq_inter = factor * freq_extra;
            let period =
                (freq_inter * freq_extra) / (freq_inter * mask + freq_extra * (1.0 - mask));
            1.0 / period
        })
        .collect()
}

fn yarn_get_mscale(scale: f32, mscale: f32) -> f32 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * mscale * scale.ln() + 1.0
    }
}
