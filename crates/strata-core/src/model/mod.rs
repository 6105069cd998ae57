//! Model loading and inference.
//!
//! Provides abstractions for transformer models:
//! - Model configuration
//! - Weight loading
//! - Forward pass with KV caching

mod attention;
mod config;
mod kv_cache;
mod layer;
mod linear;
mod loader;
mod mlp;
mod norm;
mod rope;
mod tokenizer;
mod transformer;

pub use attention::{combine_padding_mask, create_causal_mask, Attention, QkvProjection};
pub use config::{Activation, Architecture, ModelConfig, RopeScalingConfig};
pub use kv_cache::{KvCache, LayerCache};
pub use layer::DecoderLayer;
pub use linear::{Embedding, Linear, Projection};
pub use loader::{LoadReport, Loader};
pub use mlp::{GatedMlp, Mlp, PlainMlp};
pub use norm::{LayerNorm, Norm, RmsNorm};
pub use rope::RotaryEmbedding;
pub use tokenizer::Tokenizer;
pub use transformer::Model;
