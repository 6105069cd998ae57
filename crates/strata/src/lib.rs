//! # Strata
//!
//! Tiered inference engine for Phi-family language models.
//!
//! Strata runs decoder-only transformers on hardware that cannot hold
//! the whole model at once:
//! - **Layer placement**: plan which decoder layers live on the
//!   compute device and park the rest on a storage tier
//! - **Staged decoding**: parked layers are copied in per forward
//!   pass, trading latency for footprint
//! - **Low-bit weights**: int4/int8 quantization with per-row scales
//! - **Chat and completion**: Phi-3 instruct templating, streaming,
//!   stop sequences
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .model_dir("models/phi-3-mini-4k-instruct")
//!         .memory_budget_bytes(2 << 30)
//!         .build()?;
//!
//!     let reply = engine
//!         .chat(&[ChatMessage::user("Explain rotary embeddings.")])
//!         .max_tokens(256)
//!         .execute()?;
//!
//!     println!("{}", reply.text);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use strata_core::*;

mod engine;

pub use engine::{
    ChatMessage, Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult, Role,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{
        ChatMessage, Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult, Role,
    };
    pub use crate::{
        error::{Result, StrataError},
        generation::{GenerationConfig, GenerationOutput, Pipeline, StopReason},
        model::{Loader, Model, ModelConfig, Tokenizer},
        placement::{DeviceBudget, DeviceMap, Residency},
        quantization::{QuantMode, QuantizedLinear},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
