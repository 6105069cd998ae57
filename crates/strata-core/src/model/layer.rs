//! Decoder layer implementation.
//!
//! A single decoder layer in one of two residual topologies:
//! - **Sequential**: pre-norm attention block followed by a pre-norm MLP
//!   block, each with its own residual add
//! - **Parallel**: one shared pre-norm feeding attention and MLP side by
//!   side, summed into a single residual add

use crate::error::{Result, StrataError};
use crate::model::attention::Attention;
use crate::model::config::Architecture;
use crate::model::kv_cache::LayerCache;
use crate::model::mlp::{GatedMlp, Mlp, PlainMlp};
use crate::model::norm::{LayerNorm, Norm, RmsNorm};
use crate::model::rope::RotaryEmbedding;
use crate::quantization::QuantMode;
use candle_core::{Device, Tensor};

/// A single decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// Residual topology.
    architecture: Architecture,
    /// Pre-attention norm (shared by both branches in the parallel case).
    input_layernorm: Norm,
    /// Self-attention.
    attention: Attention,
    /// Pre-MLP norm; absent in the parallel topology.
    post_attention_layernorm: Option<Norm>,
    /// Feed-forward block.
    mlp: Mlp,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl DecoderLayer {
    /// Create a new decoder layer.
    ///
    /// Sequential layers require a post-attention norm; parallel layers
    /// must not carry one.
    pub fn new(
        architecture: Architecture,
        input_layernorm: Norm,
        attention: Attention,
        post_attention_layernorm: Option<Norm>,
        mlp: Mlp,
        layer_idx: usize,
    ) -> Result<Self> {
        match architecture {
            Architecture::Phi3 if post_attention_layernorm.is_none() => {
                return Err(StrataError::ModelError(format!(
                    "layer {}: sequential topology requires a post-attention norm",
                    layer_idx
                )));
            }
            Architecture::Phi2 if post_attention_layernorm.is_some() => {
                return Err(StrataError::ModelError(format!(
                    "layer {}: parallel topology has no post-attention norm",
                    layer_idx
                )));
            }
            _ => {}
        }
        Ok(Self {
            architecture,
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            layer_idx,
        })
    }

    /// Create a sequential layer with random weights (for testing).
    pub fn random(
        hidden_size: usize,
        intermediate_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        eps: f64,
        layer_idx: usize,
        device: &Device,
    ) -> Result<Self> {
        let input_layernorm = Norm::Rms(RmsNorm::ones(hidden_size, eps, device)?);
        let attention = Attention::random(hidden_size, num_heads, num_kv_heads, head_dim, device)?;
        let post_attention_layernorm = Norm::Rms(RmsNorm::ones(hidden_size, eps, device)?);
        let mlp = Mlp::Gated(GatedMlp::random(hidden_size, intermediate_size, device)?);

        Self::new(
            Architecture::Phi3,
            input_layernorm,
            attention,
            Some(post_attention_layernorm),
            mlp,
            layer_idx,
        )
    }

    /// Create a parallel layer with random weights (for testing).
    pub fn random_parallel(
        hidden_size: usize,
        intermediate_size: usize,
        num_heads: usize,
        head_dim: usize,
        eps: f64,
        layer_idx: usize,
        device: &Device,
    ) -> Result<Self> {
        let input_layernorm = Norm::Layer(LayerNorm::ones(hidden_size, eps, device)?);
        let attention = Attention::random(hidden_size, num_heads, num_heads, head_dim, device)?;
        let mlp = Mlp::Plain(PlainMlp::random(hidden_size, intermediate_size, device)?);

        Self::new(
            Architecture::Phi2,
            input_layernorm,
            attention,
            None,
            mlp,
            layer_idx,
        )
    }

    /// Forward pass with KV cache.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `rope` - Rotary position embeddings
    /// * `cache` - Layer KV cache to read from and update
    /// * `position_offset` - Absolute position of the first new token
    /// * `attention_mask` - Optional additive mask [batch, 1, seq_len, kv_len]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut LayerCache,
        position_offset: usize,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        match self.architecture {
            Architecture::Phi3 => {
                // Pre-attention norm
                let normed = self.input_layernorm.forward(hidden_states)?;

                let attn_output = self.attention.forward(
                    &normed,
                    rope,
                    cache,
                    position_offset,
                    attention_mask,
                )?;

                // Residual connection
                let hidden_states = (hidden_states + attn_output)?;

                // Pre-MLP norm
                let normed = self
                    .post_attention_layernorm
                    .as_ref()
                    .ok_or_else(|| {
                        StrataError::ModelError(format!(
                            "layer {}: missing post-attention norm",
                            self.layer_idx
                        ))
                    })?
                    .forward(&hidden_states)?;

                let mlp_output = self.mlp.forward(&normed)?;

                // Residual connection
                Ok((hidden_states + mlp_output)?)
            }
            Architecture::Phi2 => {
                // One shared norm feeds both branches
                let normed = self.input_layernorm.forward(hidden_states)?;

                let attn_output = self.attention.forward(
                    &normed,
                    rope,
                    cache,
                    position_offset,
                    attention_mask,
                )?;
                let mlp_output = self.mlp.forward(&normed)?;

                // Single residual add over both branches
                Ok(((hidden_states + attn_output)? + mlp_output)?)
            }
        }
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    /// Parameter storage in bytes.
    pub fn size_in_bytes(&self) -> usize {
        let norms = self.input_layernorm.size_in_bytes()
            + self
                .post_attention_layernorm
                .as_ref()
                .map(|n| n.size_in_bytes())
                .unwrap_or(0);
        norms + self.attention.size_in_bytes() + self.mlp.size_in_bytes()
    }

    /// Quantize the layer's attention and MLP projections.
    pub fn quantize(self, mode: QuantMode) -> Result<Self> {
        let Self {
            architecture,
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            layer_idx,
        } = self;
        Ok(Self {
            architecture,
            input_layernorm,
            attention: attention.quantize(mode)?,
            post_attention_layernorm,
            mlp: mlp.quantize(mode)?,
            layer_idx,
        })
    }

    /// Copy the layer onto another device.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            architecture: self.architecture,
            input_layernorm: self.input_layernorm.to_device(device)?,
            attention: self.attention.to_device(device)?,
            post_attention_layernorm: self
                .post_attention_layernorm
                .as_ref()
                .map(|n| n.to_device(device))
                .transpose()?,
            mlp: self.mlp.to_device(device)?,
            layer_idx: self.layer_idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attention::create_causal_mask;
    use crate::model::ModelConfig;
    use candle_core::DType;

    fn create_test_rope(head_dim: usize) -> RotaryEmbedding {
        let config = ModelConfig {
            hidden_size: head_dim * 8,
            num_attention_heads: 8,
            num_key_value_heads: Some(8),
            max_position_embeddings: 2048,
            original_max_position_embeddings: Some(2048),
            ..Default::default()
        };
        RotaryEmbedding::new(&config, &Device::Cpu).unwrap()
    }

    fn create_test_layer() -> (DecoderLayer, RotaryEmbedding) {
        let layer = DecoderLayer::random(256, 512, 4, 2, 64, 1e-5, 0, &Device::Cpu).unwrap();
        let rope = create_test_rope(64);
        (layer, rope)
    }

    #[test]
    fn layer_forward_shape() {
        let (layer, rope) = create_test_layer();
        let mut cache = LayerCache::new();

        // [batch=1, seq=16, hidden=256]
        let x = Tensor::randn(0.0f32, 1.0, &[1, 16, 256], &Device::Cpu).unwrap();
        let output = layer.forward(&x, &rope, &mut cache, 0, None).unwrap();

        assert_eq!(output.dims(), &[1, 16, 256]);
        assert_eq!(cache.seq_len(), 16);
    }

    #[test]
    fn layer_forward_with_mask() {
        let (layer, rope) = create_test_layer();
        let mut cache = LayerCache::new();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 8, 256], &Device::Cpu).unwrap();
        let mask = create_causal_mask(8, 0, None, DType::F32, &Device::Cpu).unwrap();
        let output = layer.forward(&x, &rope, &mut cache, 0, Some(&mask)).unwrap();

        assert_eq!(output.dims(), &[1, 8, 256]);
    }

    #[test]
    fn layer_decode_after_prefill() {
        let (layer, rope) = create_test_layer();
        let mut cache = LayerCache::new();

        // Prefill 8 tokens, then decode one
        let x = Tensor::randn(0.0f32, 1.0, &[1, 8, 256], &Device::Cpu).unwrap();
        let mask = create_causal_mask(8, 0, None, DType::F32, &Device::Cpu).unwrap();
        layer.forward(&x, &rope, &mut cache, 0, Some(&mask)).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 1, 256], &Device::Cpu).unwrap();
        let output = layer.forward(&x, &rope, &mut cache, 8, None).unwrap();

        assert_eq!(output.dims(), &[1, 1, 256]);
        assert_eq!(cache.seq_len(), 9);
    }

    #[test]
    fn parallel_layer_forward_shape() {
        let layer =
            DecoderLayer::random_parallel(256, 512, 4, 64, 1e-5, 0, &Device::Cpu).unwrap();
        let rope = create_test_rope(64);
        let mut cache = LayerCache::new();

        let x = Tensor::randn(0.0f32, 1.0, &[2, 8, 256], &Device::Cpu).unwrap();
        let output = layer.forward(&x, &rope, &mut cache, 0, None).unwrap();

        assert_eq!(output.dims(), &[2, 8, 256]);
    }

    #[test]
    fn sequential_requires_post_norm() {
        let attention = Attention::random(64, 4, 4, 16, &Device::Cpu).unwrap();
        let result = DecoderLayer::new(
            Architecture::Phi3,
            Norm::Rms(RmsNorm::ones(64, 1e-5, &Device::Cpu).unwrap()),
            attention,
            None,
            Mlp::Gated(GatedMlp::random(64, 128, &Device::Cpu).unwrap()),
            3,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parallel_rejects_post_norm() {
        let attention = Attention::random(64, 4, 4, 16, &Device::Cpu).unwrap();
        let result = DecoderLayer::new(
            Architecture::Phi2,
            Norm::Layer(LayerNorm::ones(64, 1e-5, &Device::Cpu).unwrap()),
            attention,
            Some(Norm::Layer(LayerNorm::ones(64, 1e-5, &Device::Cpu).unwrap())),
            Mlp::Plain(PlainMlp::random(64, 128, &Device::Cpu).unwrap()),
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn gqa_attention_works() {
        let (layer, rope) = create_test_layer();
        let mut cache = LayerCache::new();

        // GQA with 4 query heads and 2 KV heads
        assert_eq!(layer.attention().num_heads(), 4);
        assert_eq!(layer.attention().num_kv_heads(), 2);

        let x = Tensor::randn(0.0f32, 1.0, &[1, 8, 256], &Device::Cpu).unwrap();
        let output = layer.forward(&x, &rope, &mut cache, 0, None).unwrap();

        assert_eq!(output.dims(), &[1, 8, 256]);
    }

    #[test]
    fn layer_quantize_keeps_shapes() {
        let (layer, rope) = create_test_layer();
        let layer = layer.quantize(QuantMode::Int8).unwrap();
        let mut cache = LayerCache::new();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 256], &Device::Cpu).unwrap();
        let output = layer.forward(&x, &rope, &mut cache, 0, None).unwrap();

        assert_eq!(output.dims(), &[1, 4, 256]);
    }

    #[test]
    fn layer_size_accounting() {
        let (layer, _) = create_test_layer();
        let size = layer.size_in_bytes();

        // Two norms + four attention projections + two MLP projections
        let expected_norms = 2 * 256 * 4;
        let expected_attn = (256 * 256 + 2 * 128 * 256 + 256 * 256) * 4;
        let expected_mlp = (1024 * 256 + 256 * 512) * 4;
        assert_eq!(size, expected_norms + expected_attn + expected_mlp);
    }
}
