//! Full decoder model: embedding, layer stack, final norm, vocabulary head.
//!
//! `Model` owns the weights and orchestrates a cached forward pass. Layers
//! assigned to a storage device by a placement map are staged onto the
//! compute device for the duration of each forward call and released
//! right after, so a model larger than accelerator memory can still run.

use super::attention::{combine_padding_mask, create_causal_mask};
use super::config::{Architecture, ModelConfig};
use super::kv_cache::KvCache;
use super::layer::DecoderLayer;
use super::linear::{Embedding, Linear, Projection};
use super::norm::{LayerNorm, Norm, RmsNorm};
use super::rope::RotaryEmbedding;
use crate::error::{Result, StrataError};
use crate::placement::{
    device_from_name, plan_layer_placement, DeviceBudget, DeviceMap, Residency,
};
use crate::quantization::QuantMode;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

/// A decoder-only transformer for autoregressive inference.
pub struct Model {
    /// Token embedding table.
    embed_tokens: Embedding,
    /// Decoder layers, in order.
    layers: Vec<DecoderLayer>,
    /// Normalization after the last layer.
    final_norm: Norm,
    /// Projection from hidden states to vocabulary logits.
    lm_head: Projection,
    /// Rotary tables, shared by all layers.
    rope: RotaryEmbedding,
    /// Model configuration.
    config: ModelConfig,
    /// Compute device.
    device: Device,
    /// Per-layer residency; staged layers live elsewhere between calls.
    residency: Vec<Residency>,
}

impl Model {
    /// Assemble a model from its parts.
    ///
    /// The rotary tables are derived from the configuration and placed on
    /// `device`, which is also where inputs and every staged layer run.
    pub fn new(
        config: ModelConfig,
        embed_tokens: Embedding,
        layers: Vec<DecoderLayer>,
        final_norm: Norm,
        lm_head: Projection,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        if layers.len() != config.num_hidden_layers {
            return Err(StrataError::ModelError(format!(
                "expected {} layers, got {}",
                config.num_hidden_layers,
                layers.len()
            )));
        }
        let rope = RotaryEmbedding::new(&config, &device)?;
        let residency = vec![Residency::Resident; layers.len()];
        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            rope,
            config,
            device,
            residency,
        })
    }

    /// Create a model with small random weights (for testing).
    pub fn random(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let embed_tokens = Embedding::random(config.vocab_size, config.hidden_size, device)?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let layer = match config.architecture {
                Architecture::Phi3 => DecoderLayer::random(
                    config.hidden_size,
                    config.intermediate_size,
                    config.num_attention_heads,
                    config.num_kv_heads(),
                    config.head_dim(),
                    config.norm_eps(),
                    idx,
                    device,
                )?,
                Architecture::Phi2 => DecoderLayer::random_parallel(
                    config.hidden_size,
                    config.intermediate_size,
                    config.num_attention_heads,
                    config.head_dim(),
                    config.norm_eps(),
                    idx,
                    device,
                )?,
            };
            layers.push(layer);
        }

        let final_norm = match config.architecture {
            Architecture::Phi3 => {
                Norm::Rms(RmsNorm::ones(config.hidden_size, config.norm_eps(), device)?)
            }
            Architecture::Phi2 => {
                Norm::Layer(LayerNorm::ones(config.hidden_size, config.norm_eps(), device)?)
            }
        };
        let lm_head = Projection::Dense(Linear::random(
            config.hidden_size,
            config.vocab_size,
            config.architecture.uses_bias(),
            device,
        )?);

        Self::new(
            config.clone(),
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            device.clone(),
        )
    }

    /// Run the model over new tokens, reading and extending the cache.
    ///
    /// Exactly one of `input_ids` `[batch, seq_len]` or `inputs_embeds`
    /// `[batch, seq_len, hidden_size]` must be given. `attention_mask`,
    /// when present, is a `[batch, kv_len]` padding mask with 1 for real
    /// tokens and 0 for padding, covering cached positions plus the new
    /// ones. Positions for the new tokens continue from the cached length.
    ///
    /// Returns logits `[batch, seq_len, vocab_size]`, always in f32.
    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let mut hidden_states = match (input_ids, inputs_embeds) {
            (Some(_), Some(_)) => {
                return Err(StrataError::InvalidInput(
                    "pass either input_ids or inputs_embeds, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(StrataError::InvalidInput(
                    "either input_ids or inputs_embeds is required".to_string(),
                ))
            }
            (Some(ids), None) => self.embed_tokens.forward(ids)?,
            (None, Some(embeds)) => embeds.clone(),
        };

        let (_batch, seq_len, _hidden) = hidden_states.dims3()?;
        let position_offset = cache.usable_length(seq_len, 0);
        let mask = self.build_mask(seq_len, position_offset, attention_mask, hidden_states.dtype())?;

        for (idx, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.layer_mut(idx);
            hidden_states = match self.residency[idx] {
                Residency::Resident => layer.forward(
                    &hidden_states,
                    &self.rope,
                    layer_cache,
                    position_offset,
                    mask.as_ref(),
                )?,
                Residency::NeedsLoad => {
                    // Staged copy lives only for this layer's compute
                    let staged = layer.to_device(&self.device)?;
                    staged.forward(
                        &hidden_states,
                        &self.rope,
                        layer_cache,
                        position_offset,
                        mask.as_ref(),
                    )?
                }
            };
        }

        let hidden_states = self.final_norm.forward(&hidden_states)?;
        let logits = self.lm_head.forward(&hidden_states)?;

        // Vocabulary logits are reported in f32 whatever the working dtype
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Build the additive attention mask for this step, if one is needed.
    ///
    /// A single new token with no sliding window and no padding attends to
    /// everything cached, so no mask is materialized.
    fn build_mask(
        &self,
        seq_len: usize,
        past_len: usize,
        padding_mask: Option<&Tensor>,
        dtype: DType,
    ) -> Result<Option<Tensor>> {
        if seq_len == 1 && self.config.sliding_window.is_none() && padding_mask.is_none() {
            return Ok(None);
        }

        let causal = create_causal_mask(
            seq_len,
            past_len,
            self.config.sliding_window,
            dtype,
            &self.device,
        )?;
        match padding_mask {
            Some(padding) => {
                let (_batch, kv_len) = padding.dims2()?;
                if kv_len != past_len + seq_len {
                    return Err(StrataError::ShapeMismatch(format!(
                        "padding mask covers {} positions, expected {}",
                        kv_len,
                        past_len + seq_len
                    )));
                }
                Ok(Some(combine_padding_mask(&causal, padding)?))
            }
            None => Ok(Some(causal)),
        }
    }

    /// Create an empty KV cache sized for this model.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(
            self.config.num_hidden_layers,
            self.config.max_position_embeddings,
            self.device.clone(),
        )
    }

    /// Quantize every decoder layer and the vocabulary head in place.
    ///
    /// The embedding table and normalization weights stay in their
    /// original dtype.
    pub fn quantize(self, mode: QuantMode) -> Result<Self> {
        let Model {
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            rope,
            config,
            device,
            residency,
        } = self;

        let layers = layers
            .into_iter()
            .map(|layer| layer.quantize(mode))
            .collect::<Result<Vec<_>>>()?;
        let lm_head = lm_head.quantize(mode)?;

        Ok(Model {
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            rope,
            config,
            device,
            residency,
        })
    }

    /// Per-layer parameter sizes, keyed by dotted layer path.
    pub fn layer_sizes(&self) -> Vec<(String, usize)> {
        self.layers
            .iter()
            .map(|layer| {
                (
                    format!("model.layers.{}", layer.layer_idx()),
                    layer.size_in_bytes(),
                )
            })
            .collect()
    }

    /// Plan a placement of this model's layers over the given devices.
    pub fn plan_placement(&self, devices: &[DeviceBudget]) -> Result<DeviceMap> {
        plan_layer_placement(&self.layer_sizes(), devices)
    }

    /// Move layers to their mapped devices and record residency.
    ///
    /// `compute_device` names where the forward pass runs; layers mapped
    /// to it stay resident, all others are parked on their mapped device
    /// and staged in per forward call. Non-layer modules (embedding,
    /// final norm, head, rotary tables) always live on the compute device.
    pub fn apply_device_map(&mut self, map: &DeviceMap, compute_device: &str) -> Result<()> {
        let compute = device_from_name(compute_device)?;

        let mut layers = Vec::with_capacity(self.layers.len());
        let mut residency = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let key = format!("model.layers.{}", layer.layer_idx());
            let assigned = map.device_for(&key).ok_or_else(|| {
                StrataError::PlacementError(format!("no device assignment for {}", key))
            })?;
            if assigned == compute_device {
                layers.push(layer.to_device(&compute)?);
                residency.push(Residency::Resident);
            } else {
                let storage = device_from_name(assigned)?;
                layers.push(layer.to_device(&storage)?);
                residency.push(Residency::NeedsLoad);
            }
        }

        self.embed_tokens = self.embed_tokens.to_device(&compute)?;
        self.final_norm = self.final_norm.to_device(&compute)?;
        self.lm_head = self.lm_head.to_device(&compute)?;
        self.rope = RotaryEmbedding::new(&self.config, &compute)?;
        self.layers = layers;
        self.residency = residency;
        self.device = compute;
        debug!(
            resident = self
                .residency
                .iter()
                .filter(|r| **r == Residency::Resident)
                .count(),
            staged = self
                .residency
                .iter()
                .filter(|r| **r == Residency::NeedsLoad)
                .count(),
            "device map applied"
        );
        Ok(())
    }

    /// Residency of one layer.
    pub fn residency(&self, layer_idx: usize) -> Residency {
        self.residency[layer_idx]
    }

    /// Total parameter bytes across all modules.
    pub fn size_in_bytes(&self) -> usize {
        let layer_bytes: usize = self.layers.iter().map(|l| l.size_in_bytes()).sum();
        self.embed_tokens.size_in_bytes()
            + layer_bytes
            + self.final_norm.size_in_bytes()
            + self.lm_head.size_in_bytes()
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get the compute device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The model's working dtype, from the embedding table.
    pub fn dtype(&self) -> DType {
        self.embed_tokens.weight().dtype()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("architecture", &self.config.architecture)
            .field("num_layers", &self.layers.len())
            .field("hidden_size", &self.config.hidden_size)
            .field("vocab_size", &self.config.vocab_size)
            .field("device", &self.device)
            .finish()
    }
}
