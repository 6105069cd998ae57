//! Checkpoint loading from safetensors files.
//!
//! `Loader` reads every tensor of a checkpoint into memory, either from a
//! sharded checkpoint's `model.safetensors.index.json` manifest or from
//! all `.safetensors` files in a directory. `build_model` then assembles a
//! [`Model`] from the named tensors, using the layout of whichever
//! architecture the configuration declares.
//!
//! Loading is non-strict in the checkpoint direction: tensors the model
//! has no use for (rotary buffers, optimizer leftovers) are tolerated and
//! surfaced in a [`LoadReport`]. Missing model parameters are fatal.

use super::attention::{Attention, QkvProjection};
use super::config::{Architecture, ModelConfig};
use super::layer::DecoderLayer;
use super::linear::{Embedding, Linear, Projection};
use super::mlp::{GatedMlp, Mlp, PlainMlp};
use super::norm::{LayerNorm, Norm, RmsNorm};
use super::transformer::Model;
use crate::error::{Result, StrataError};
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Manifest of a sharded safetensors checkpoint.
#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// What a checkpoint had relative to what the model wanted.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Parameters the architecture requires that the checkpoint lacks.
    pub missing: Vec<String>,
    /// Checkpoint tensors no parameter consumed.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    /// Whether the checkpoint matched the architecture exactly.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Checkpoint loader holding named tensors.
pub struct Loader {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
    /// Device tensors were loaded to.
    device: Device,
}

impl Loader {
    /// Load a checkpoint from a model directory.
    ///
    /// Follows `model.safetensors.index.json` when present, otherwise
    /// loads every `.safetensors` file in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let manifest = dir.join("model.safetensors.index.json");
        let files = if manifest.is_file() {
            Self::shard_files(dir, &manifest)?
        } else {
            let mut files: Vec<PathBuf> = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map_or(false, |e| e == "safetensors") {
                    files.push(path);
                }
            }
            // Deterministic loading order
            files.sort();
            files
        };

        if files.is_empty() {
            return Err(StrataError::ModelError(format!(
                "no .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }
        debug!(
            files = files.len(),
            tensors = tensors.len(),
            "loaded checkpoint"
        );
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Load a checkpoint from a single safetensors file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Shard paths listed by an index manifest, deduplicated.
    fn shard_files(dir: &Path, manifest: &Path) -> Result<Vec<PathBuf>> {
        let contents = fs::read_to_string(manifest)?;
        let index: SafetensorsIndex = serde_json::from_str(&contents)?;

        let mut names: Vec<&String> = index.weight_map.values().collect();
        names.sort();
        names.dedup();
        Ok(names.into_iter().map(|name| dir.join(name)).collect())
    }

    /// Load all tensors from one safetensors file.
    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
            StrataError::ModelError(format!("failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            tensors.insert(name.to_string(), Self::view_to_tensor(&view, device)?);
        }
        Ok(tensors)
    }

    /// Convert a safetensors view into a candle tensor.
    fn view_to_tensor(
        view: &safetensors::tensor::TensorView,
        device: &Device,
    ) -> Result<Tensor> {
        fn cast<'a, T: bytemuck::Pod>(data: &'a [u8]) -> Result<&'a [T]> {
            bytemuck::try_cast_slice(data).map_err(|e| {
                StrataError::ModelError(format!("checkpoint buffer cast failed: {}", e))
            })
        }

        let shape = view.shape().to_vec();
        let data = view.data();

        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                Tensor::from_slice(cast::<f32>(data)?, shape.as_slice(), device)?
            }
            safetensors::Dtype::F16 => {
                Tensor::from_slice(cast::<half::f16>(data)?, shape.as_slice(), device)?
            }
            safetensors::Dtype::BF16 => {
                Tensor::from_slice(cast::<half::bf16>(data)?, shape.as_slice(), device)?
            }
            safetensors::Dtype::I64 => {
                Tensor::from_slice(cast::<i64>(data)?, shape.as_slice(), device)?
            }
            safetensors::Dtype::U32 => {
                Tensor::from_slice(cast::<u32>(data)?, shape.as_slice(), device)?
            }
            safetensors::Dtype::U8 => Tensor::from_slice(data, shape.as_slice(), device)?,
            other => {
                return Err(StrataError::ModelError(format!(
                    "unsupported checkpoint dtype: {:?}",
                    other
                )));
            }
        };
        Ok(tensor)
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a tensor by name, cast to `dtype`.
    pub fn get_tensor(&self, name: &str, dtype: DType) -> Result<Tensor> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| StrataError::ModelError(format!("tensor not found: {}", name)))?;
        Ok(tensor.to_dtype(dtype)?)
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// All tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get the device tensors are loaded to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Compare the checkpoint against what `config` requires.
    pub fn report(&self, config: &ModelConfig) -> LoadReport {
        let required: HashSet<String> = required_names(config).into_iter().collect();

        let mut missing: Vec<String> = required
            .iter()
            .filter(|name| !self.tensors.contains_key(*name))
            .cloned()
            .collect();
        missing.sort();

        let mut unexpected: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| !required.contains(*name))
            .cloned()
            .collect();
        unexpected.sort();

        LoadReport {
            missing,
            unexpected,
        }
    }

    /// Assemble a model from the loaded tensors.
    ///
    /// Weights are cast to `dtype`. Every required parameter must be
    /// present; the returned report lists whatever else the checkpoint
    /// carried.
    pub fn build_model(&self, config: &ModelConfig, dtype: DType) -> Result<(Model, LoadReport)> {
        config.validate()?;
        let report = self.report(config);
        if !report.missing.is_empty() {
            return Err(StrataError::ModelError(format!(
                "checkpoint is missing {} tensors: {}",
                report.missing.len(),
                report.missing.join(", ")
            )));
        }

        let embed_tokens = Embedding::new(self.get_tensor("model.embed_tokens.weight", dtype)?)?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            layers.push(self.build_layer(config, idx, dtype)?);
        }

        let (final_norm, lm_head) = match config.architecture {
            Architecture::Phi3 => {
                let norm = Norm::Rms(RmsNorm::new(
                    self.get_tensor("model.norm.weight", dtype)?,
                    config.norm_eps(),
                )?);
                let head = if config.tie_word_embeddings {
                    Linear::new(embed_tokens.weight().clone(), None)?
                } else {
                    Linear::new(self.get_tensor("lm_head.weight", dtype)?, None)?
                };
                (norm, Projection::Dense(head))
            }
            Architecture::Phi2 => {
                let norm = Norm::Layer(LayerNorm::new(
                    self.get_tensor("model.final_layernorm.weight", dtype)?,
                    self.get_tensor("model.final_layernorm.bias", dtype)?,
                    config.norm_eps(),
                )?);
                let head = Linear::new(
                    self.get_tensor("lm_head.weight", dtype)?,
                    Some(self.get_tensor("lm_head.bias", dtype)?),
                )?;
                (norm, Projection::Dense(head))
            }
        };

        let model = Model::new(
            config.clone(),
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            self.device.clone(),
        )?;
        Ok((model, report))
    }

    /// Assemble a model, tolerating missing parameters.
    ///
    /// Parameters the checkpoint lacks are left at their initialization
    /// values (ones for norm scales, zeros for biases, small random
    /// weights elsewhere) and listed in the returned report. Treat a
    /// non-empty missing list as a correctness risk, not a cosmetic one.
    pub fn build_model_non_strict(
        &self,
        config: &ModelConfig,
        dtype: DType,
    ) -> Result<(Model, LoadReport)> {
        config.validate()?;
        let report = self.report(config);
        if report.missing.is_empty() {
            return self.build_model(config, dtype);
        }
        warn!(
            missing = report.missing.len(),
            first = report.missing.first().map(String::as_str),
            "checkpoint is incomplete, missing parameters keep their initialization values"
        );

        // Tensor clones are shallow, so patching a copy of the map is cheap
        let mut tensors = self.tensors.clone();
        for name in &report.missing {
            tensors.insert(name.clone(), initial_value(name, config, &self.device)?);
        }
        let patched = Self {
            tensors,
            device: self.device.clone(),
        };
        let (model, _) = patched.build_model(config, dtype)?;
        Ok((model, report))
    }

    /// Load one decoder layer's parameters.
    fn build_layer(&self, config: &ModelConfig, idx: usize, dtype: DType) -> Result<DecoderLayer> {
        let prefix = format!("model.layers.{}", idx);
        let linear = |name: &str, with_bias: bool| -> Result<Projection> {
            let weight = self.get_tensor(&format!("{}.{}.weight", prefix, name), dtype)?;
            let bias = if with_bias {
                Some(self.get_tensor(&format!("{}.{}.bias", prefix, name), dtype)?)
            } else {
                None
            };
            Ok(Projection::Dense(Linear::new(weight, bias)?))
        };

        match config.architecture {
            Architecture::Phi3 => {
                let input_layernorm = Norm::Rms(RmsNorm::new(
                    self.get_tensor(&format!("{}.input_layernorm.weight", prefix), dtype)?,
                    config.norm_eps(),
                )?);
                let post_attention_layernorm = Norm::Rms(RmsNorm::new(
                    self.get_tensor(
                        &format!("{}.post_attention_layernorm.weight", prefix),
                        dtype,
                    )?,
                    config.norm_eps(),
                )?);

                let attention = Attention::new(
                    QkvProjection::Fused(linear("self_attn.qkv_proj", false)?),
                    linear("self_attn.o_proj", false)?,
                    None,
                    None,
                    config.num_attention_heads,
                    config.num_kv_heads(),
                    config.head_dim(),
                )?;
                let mlp = Mlp::Gated(GatedMlp::new(
                    linear("mlp.gate_up_proj", false)?,
                    linear("mlp.down_proj", false)?,
                    config.hidden_act,
                )?);

                DecoderLayer::new(
                    Architecture::Phi3,
                    input_layernorm,
                    attention,
                    Some(post_attention_layernorm),
                    mlp,
                    idx,
                )
            }
            Architecture::Phi2 => {
                let input_layernorm = Norm::Layer(LayerNorm::new(
                    self.get_tensor(&format!("{}.input_layernorm.weight", prefix), dtype)?,
                    self.get_tensor(&format!("{}.input_layernorm.bias", prefix), dtype)?,
                    config.norm_eps(),
                )?);

                let (q_norm, k_norm) = if config.qk_layernorm {
                    let load_norm = |name: &str| -> Result<LayerNorm> {
                        LayerNorm::new(
                            self.get_tensor(&format!("{}.self_attn.{}.weight", prefix, name), dtype)?,
                            self.get_tensor(&format!("{}.self_attn.{}.bias", prefix, name), dtype)?,
                            config.norm_eps(),
                        )
                    };
                    (Some(load_norm("q_layernorm")?), Some(load_norm("k_layernorm")?))
                } else {
                    (None, None)
                };

                let attention = Attention::new(
                    QkvProjection::Split {
                        q_proj: linear("self_attn.q_proj", true)?,
                        k_proj: linear("self_attn.k_proj", true)?,
                        v_proj: linear("self_attn.v_proj", true)?,
                    },
                    linear("self_attn.dense", true)?,
                    q_norm,
                    k_norm,
                    config.num_attention_heads,
                    config.num_kv_heads(),
                    config.head_dim(),
                )?;
                let mlp = Mlp::Plain(PlainMlp::new(
                    linear("mlp.fc1", true)?,
                    linear("mlp.fc2", true)?,
                    config.hidden_act,
                )?);

                DecoderLayer::new(
                    Architecture::Phi2,
                    input_layernorm,
                    attention,
                    None,
                    mlp,
                    idx,
                )
            }
        }
    }

    /// Load a model directory: `config.json` plus checkpoint shards.
    pub fn load_model(dir: &Path, dtype: DType, device: &Device) -> Result<(Model, LoadReport)> {
        let config = ModelConfig::from_dir(dir)?;
        let loader = Self::from_dir(dir, device)?;
        loader.build_model(&config, dtype)
    }
}

/// Every tensor name `config`'s architecture requires.
fn required_names(config: &ModelConfig) -> Vec<String> {
    let mut names = vec!["model.embed_tokens.weight".to_string()];

    for idx in 0..config.num_hidden_layers {
        let prefix = format!("model.layers.{}", idx);
        match config.architecture {
            Architecture::Phi3 => {
                for suffix in [
                    "input_layernorm.weight",
                    "self_attn.qkv_proj.weight",
                    "self_attn.o_proj.weight",
                    "post_attention_layernorm.weight",
                    "mlp.gate_up_proj.weight",
                    "mlp.down_proj.weight",
                ] {
                    names.push(format!("{}.{}", prefix, suffix));
                }
            }
            Architecture::Phi2 => {
                for module in [
                    "input_layernorm",
                    "self_attn.q_proj",
                    "self_attn.k_proj",
                    "self_attn.v_proj",
                    "self_attn.dense",
                    "mlp.fc1",
                    "mlp.fc2",
                ] {
                    names.push(format!("{}.{}.weight", prefix, module));
                    names.push(format!("{}.{}.bias", prefix, module));
                }
                if config.qk_layernorm {
                    for module in ["self_attn.q_layernorm", "self_attn.k_layernorm"] {
                        names.push(format!("{}.{}.weight", prefix, module));
                        names.push(format!("{}.{}.bias", prefix, module));
                    }
                }
            }
        }
    }

    match config.architecture {
        Architecture::Phi3 => {
            names.push("model.norm.weight".to_string());
            if !config.tie_word_embeddings {
                names.push("lm_head.weight".to_string());
            }
        }
        Architecture::Phi2 => {
            names.push("model.final_layernorm.weight".to_string());
            names.push("model.final_layernorm.bias".to_string());
            names.push("lm_head.weight".to_string());
            names.push("lm_head.bias".to_string());
        }
    }
    names
}

/// Initialization value for a parameter the checkpoint did not provide.
///
/// Only names emitted by [`required_names`] are supported.
fn initial_value(name: &str, config: &ModelConfig, device: &Device) -> Result<Tensor> {
    let hidden = config.hidden_size;
    let inter = config.intermediate_size;
    let vocab = config.vocab_size;
    let head_dim = config.head_dim();
    let q_dim = config.num_attention_heads * head_dim;
    let kv_dim = config.num_kv_heads() * head_dim;
    let qkv_dim = q_dim + 2 * kv_dim;

    let weight_shape: Option<(usize, usize)> = if name == "model.embed_tokens.weight"
        || name == "lm_head.weight"
    {
        Some((vocab, hidden))
    } else if name.ends_with("self_attn.qkv_proj.weight") {
        Some((qkv_dim, hidden))
    } else if name.ends_with("self_attn.q_proj.weight") {
        Some((q_dim, hidden))
    } else if name.ends_with("self_attn.k_proj.weight") || name.ends_with("self_attn.v_proj.weight")
    {
        Some((kv_dim, hidden))
    } else if name.ends_with("self_attn.o_proj.weight") || name.ends_with("self_attn.dense.weight")
    {
        Some((hidden, q_dim))
    } else if name.ends_with("mlp.gate_up_proj.weight") {
        Some((2 * inter, hidden))
    } else if name.ends_with("mlp.fc1.weight") {
        Some((inter, hidden))
    } else if name.ends_with("mlp.down_proj.weight") || name.ends_with("mlp.fc2.weight") {
        Some((hidden, inter))
    } else {
        None
    };
    if let Some((out, inp)) = weight_shape {
        return Ok(Tensor::randn(0.0f32, 0.02, &[out, inp], device)?);
    }

    let per_head = name.contains("self_attn.q_layernorm") || name.contains("self_attn.k_layernorm");
    let bias_len: Option<usize> = if name == "lm_head.bias" {
        Some(vocab)
    } else if name.ends_with("self_attn.q_proj.bias") {
        Some(q_dim)
    } else if name.ends_with("self_attn.k_proj.bias") || name.ends_with("self_attn.v_proj.bias") {
        Some(kv_dim)
    } else if name.ends_with("self_attn.dense.bias") || name.ends_with("mlp.fc2.bias") {
        Some(hidden)
    } else if name.ends_with("mlp.fc1.bias") {
        Some(inter)
    } else if name.ends_with(".bias") {
        Some(if per_head { head_dim } else { hidden })
    } else {
        None
    };
    if let Some(len) = bias_len {
        return Ok(Tensor::zeros(len, DType::F32, device)?);
    }

    if name.ends_with("norm.weight") {
        let len = if per_head { head_dim } else { hidden };
        return Ok(Tensor::ones(len, DType::F32, device)?);
    }

    Err(StrataError::ModelError(format!(
        "no initializer for parameter {}",
        name
    )))
}
