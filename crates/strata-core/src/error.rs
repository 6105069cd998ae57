//! Error types for Strata Core.

use thiserror::Error;

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Invalid or inconsistent model configuration.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Model construction or weight loading error.
    #[error("model error: {0}")]
    ModelError(String),

    /// Input violates the forward-pass contract.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    /// Generation loop error.
    #[error("generation error: {0}")]
    GenerationError(String),

    /// Device placement planning error.
    #[error("placement error: {0}")]
    PlacementError(String),

    /// Quantization error.
    #[error("quantization error: {0}")]
    QuantizationError(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
