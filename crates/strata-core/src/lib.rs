//! Core types and configuration for the strata decode runtime.
//!
//! This crate provides the foundational pieces shared by the kernel and
//! session crates:
//!
//! - The error taxonomy used across the runtime
//! - Construction-time configuration for caches, rotary encoding and MoE
//! - Parsing of Hugging Face `config.json` files into session configs

#![warn(missing_docs)]

mod config;
mod error;

pub use config::*;
pub use error::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Result, StrataError};
}
