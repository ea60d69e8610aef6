//! Quantization used by the key/value cache.
//!
//! Only affine group quantization is needed at decode time: the quantized
//! cache stores packed words plus per-group scale and bias on the device and
//! unpacks them there on read.

pub mod group;

pub use group::{
    GroupQuantConfig, GroupQuantizedRows, GroupQuantizer, QuantizedArrays, Unpacker,
};
