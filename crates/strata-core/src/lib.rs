//! # Strata Core
//!
//! Core inference engine for Phi-family decoder-only transformers.
//!
//! This crate provides:
//! - **Transformer forward pass** for the sequential (Phi-3) and parallel
//!   (Phi-2) decoder variants, with grouped-query attention and rotary
//!   position embeddings
//! - **KV cache** for incremental decoding
//! - **Autoregressive generation** with temperature/top-p sampling and
//!   stop-sequence handling
//! - **Layer placement** across heterogeneous devices with staged loading
//! - **Int4/int8 weight quantization** with packed storage

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generation;
pub mod model;
pub mod placement;
pub mod quantization;

pub use error::{Result, StrataError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Result, StrataError};
    pub use crate::generation::{GenerationConfig, GenerationOutput, Pipeline, StopReason};
    pub use crate::model::{Architecture, KvCache, Loader, Model, ModelConfig, Tokenizer};
    pub use crate::placement::{DeviceBudget, DeviceMap, Residency};
    pub use crate::quantization::{QuantMode, QuantizedLinear};
}
