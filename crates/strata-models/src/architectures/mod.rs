//! Model architectures.

pub mod tiny_moe;

pub use tiny_moe::TinyMoeModel;
