//! Model configuration.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// Which of the two supported decoder architectures a checkpoint uses.
///
/// The variants differ in normalization (RMSNorm vs LayerNorm), projection
/// layout (fused bias-free qkv vs separate biased q/k/v), feed-forward shape
/// (gated vs plain), rotary coverage (full vs partial head dim), and residual
/// topology (sequential pre-norm blocks vs a single shared pre-norm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// Sequential pre-norm blocks, RMSNorm, fused qkv, gated SiLU MLP.
    #[serde(rename = "phi3")]
    Phi3,
    /// Parallel attention + MLP off one LayerNorm, biased projections.
    #[serde(rename = "phi")]
    Phi2,
}

impl Architecture {
    /// Whether linear projections (and lm_head) carry bias vectors.
    pub fn uses_bias(&self) -> bool {
        matches!(self, Architecture::Phi2)
    }
}

/// Activation function used inside the feed-forward block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// SiLU (sigmoid-weighted linear unit).
    #[serde(rename = "silu")]
    Silu,
    /// Tanh-approximated GELU.
    #[serde(rename = "gelu_new")]
    GeluNew,
}

impl Activation {
    /// Apply the activation elementwise.
    pub fn forward(&self, x: &candle_core::Tensor) -> Result<candle_core::Tensor> {
        match self {
            Activation::Silu => Ok(candle_nn::ops::silu(x)?),
            // candle's gelu is the tanh approximation:
            // 0.5x(1 + tanh(sqrt(2/pi)(x + 0.044715x^3)))
            Activation::GeluNew => Ok(x.gelu()?),
        }
    }
}

/// Long-context rotary scaling parameters.
///
/// Two per-frequency factor arrays; the long set is used once positions pass
/// the originally trained context length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RopeScalingConfig {
    /// Scaling scheme name (e.g. "su", "longrope"). Informational.
    #[serde(rename = "type", default)]
    pub scaling_type: String,
    /// Per-frequency divisors for positions within the original context.
    pub short_factor: Vec<f64>,
    /// Per-frequency divisors for positions beyond the original context.
    pub long_factor: Vec<f64>,
}

/// Configuration for a decoder-only transformer model.
///
/// Deserialized from a model directory's `config.json`; unknown fields are
/// ignored and missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture variant, from the `model_type` field.
    #[serde(rename = "model_type", default = "default_architecture")]
    pub architecture: Architecture,
    /// Vocabulary size.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Hidden dimension.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    /// Number of layers.
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA). Required; no default.
    pub num_key_value_heads: Option<usize>,
    /// Activation function.
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Context length the model was originally trained at.
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    /// RMS norm epsilon.
    #[serde(default = "default_norm_eps")]
    pub rms_norm_eps: f64,
    /// LayerNorm epsilon (parallel variant).
    #[serde(default = "default_norm_eps")]
    pub layer_norm_eps: f64,
    /// Rope theta (base frequency).
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Long-context rotary scaling, when configured.
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    /// Fraction of each head that receives rotation.
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f64,
    /// Per-head LayerNorm on query/key projections (parallel variant).
    #[serde(default)]
    pub qk_layernorm: bool,
    /// Sliding-window attention span, when configured.
    #[serde(default)]
    pub sliding_window: Option<usize>,
    /// Whether lm_head shares the embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Beginning-of-sequence token id.
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token id.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

fn default_architecture() -> Architecture {
    Architecture::Phi3
}

fn default_vocab_size() -> usize {
    32064
}

fn default_hidden_size() -> usize {
    3072
}

fn default_intermediate_size() -> usize {
    8192
}

fn default_num_hidden_layers() -> usize {
    32
}

fn default_num_attention_heads() -> usize {
    32
}

fn default_hidden_act() -> Activation {
    Activation::Silu
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_partial_rotary_factor() -> f64 {
    1.0
}

impl ModelConfig {
    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of KV heads; call `validate` first.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads
            .unwrap_or(self.num_attention_heads)
    }

    /// Get GQA ratio (query heads per KV head).
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    /// Number of head dimensions that receive rotary rotation.
    pub fn rotary_dim(&self) -> usize {
        (self.head_dim() as f64 * self.partial_rotary_factor) as usize
    }

    /// Context length the model was trained at before any rope scaling.
    pub fn original_max_positions(&self) -> usize {
        self.original_max_position_embeddings
            .unwrap_or(self.max_position_embeddings)
    }

    /// Check the construction-time invariants; violations are fatal.
    pub fn validate(&self) -> Result<()> {
        let num_kv_heads = self.num_key_value_heads.ok_or_else(|| {
            StrataError::ConfigError("num_key_value_heads must be specified".to_string())
        })?;
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(StrataError::ConfigError(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % num_kv_heads != 0 {
            return Err(StrataError::ConfigError(format!(
                "num_attention_heads {} is not divisible by num_key_value_heads {}",
                self.num_attention_heads, num_kv_heads
            )));
        }
        if !(0.0..=1.0).contains(&self.partial_rotary_factor) || self.rotary_dim() == 0 {
            return Err(StrataError::ConfigError(format!(
                "partial_rotary_factor {} must leave a nonzero rotary prefix",
                self.partial_rotary_factor
            )));
        }
        if self.rotary_dim() % 2 != 0 {
            return Err(StrataError::ConfigError(format!(
                "rotary dimension {} must be even",
                self.rotary_dim()
            )));
        }
        Ok(())
    }

    /// Epsilon for the variant's normalization layers.
    pub fn norm_eps(&self) -> f64 {
        match self.architecture {
            Architecture::Phi3 => self.rms_norm_eps,
            Architecture::Phi2 => self.layer_norm_eps,
        }
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a model directory's `config.json`.
    pub fn from_dir(dir: &std::path::Path) -> Result<Self> {
        Self::from_file(&dir.join("config.json"))
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Phi-3-mini-4k-instruct hyperparameters.
        Self {
            architecture: Architecture::Phi3,
            vocab_size: 32064,
            hidden_size: 3072,
            intermediate_size: 8192,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            hidden_act: Activation::Silu,
            max_position_embeddings: 4096,
            original_max_position_embeddings: Some(4096),
            rms_norm_eps: 1e-5,
            layer_norm_eps: 1e-5,
            rope_theta: 10000.0,
            rope_scaling: None,
            partial_rotary_factor: 1.0,
            qk_layernorm: false,
            sliding_window: None,
            tie_word_embeddings: false,
            bos_token_id: Some(1),
            eos_token_id: Some(32000),
            pad_token_id: Some(32000),
        }
    }
}

impl ModelConfig {
    /// Phi-2 hyperparameters (parallel variant).
    pub fn phi2() -> Self {
        Self {
            architecture: Architecture::Phi2,
            vocab_size: 51200,
            hidden_size: 2048,
            intermediate_size: 8192,
            num_hidden_layers: 24,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            hidden_act: Activation::GeluNew,
            max_position_embeddings: 2048,
            original_max_position_embeddings: None,
            rms_norm_eps: 1e-5,
            layer_norm_eps: 1e-5,
            rope_theta: 10000.0,
            rope_scaling: None,
            partial_rotary_factor: 0.5,
            qk_layernorm: false,
            sliding_window: None,
            tie_word_embeddings: false,
            bos_token_id: Some(1),
            eos_token_id: Some(2),
            pad_token_id: None,
        }
    }
}
