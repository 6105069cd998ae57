//! High-level inference engine.

use anyhow::{Context, Result};
use candle_core::DType;
use std::path::PathBuf;
use std::time::Instant;
use strata_core::generation::{GenerationConfig, GenerationOutput, Pipeline, StopReason};
use strata_core::model::{Loader, Model, Tokenizer};
use strata_core::placement::{device_from_name, DeviceBudget, Residency};
use strata_core::quantization::QuantMode;
use tracing::info;

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model directory holding `config.json`, `tokenizer.json` and
    /// safetensors weights.
    pub model_dir: PathBuf,
    /// Compute device name: `cpu`, `cuda:N` or `metal:N`.
    pub device: String,
    /// Working dtype for model weights and activations.
    pub dtype: DType,
    /// Compute-device byte budget for layer placement. `None` keeps
    /// every layer resident on the compute device.
    pub memory_budget_bytes: Option<usize>,
    /// Quantize linear weights after loading.
    pub quantization: Option<QuantMode>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::new(),
            device: "cpu".to_string(),
            dtype: DType::F32,
            memory_budget_bytes: None,
            quantization: None,
        }
    }
}

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Set the model directory.
    pub fn model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_dir = dir.into();
        self
    }

    /// Set the compute device by name (`cpu`, `cuda:0`, `metal:0`).
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = device.into();
        self
    }

    /// Set the working dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.config.dtype = dtype;
        self
    }

    /// Cap compute-device memory; layers beyond the budget are parked
    /// on storage and copied in per forward pass.
    pub fn memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.config.memory_budget_bytes = Some(bytes);
        self
    }

    /// Quantize linear weights after loading.
    pub fn quantization(mut self, mode: QuantMode) -> Self {
        self.config.quantization = Some(mode);
        self
    }

    /// Load the model and build the engine.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        let device = device_from_name(&config.device)?;

        let load_start = Instant::now();
        let (mut model, report) = Loader::load_model(&config.model_dir, config.dtype, &device)
            .with_context(|| format!("loading model from {}", config.model_dir.display()))?;
        info!(
            layers = model.num_layers(),
            elapsed_s = load_start.elapsed().as_secs_f64(),
            "model loaded"
        );
        if !report.unexpected.is_empty() {
            info!(
                count = report.unexpected.len(),
                "ignored checkpoint tensors not used by the architecture"
            );
        }

        if let Some(mode) = config.quantization {
            model = model.quantize(mode)?;
            info!(?mode, "quantized linear weights");
        }

        if let Some(budget) = config.memory_budget_bytes {
            let tiers = [
                DeviceBudget::new(config.device.as_str(), budget),
                DeviceBudget::new("disk", usize::MAX),
            ];
            let map = model.plan_placement(&tiers)?;
            model.apply_device_map(&map, &config.device)?;
            let staged = (0..model.num_layers())
                .filter(|&idx| model.residency(idx) == Residency::NeedsLoad)
                .count();
            info!(
                resident = model.num_layers() - staged,
                staged, "layer placement applied"
            );
        }

        let tokenizer = Tokenizer::from_dir(&config.model_dir)?;
        Ok(Engine {
            config,
            pipeline: Pipeline::new(model, tokenizer),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level inference engine over one loaded model.
pub struct Engine {
    config: EngineConfig,
    pipeline: Pipeline,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the underlying generation pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Get the loaded model.
    pub fn model(&self) -> &Model {
        self.pipeline.model()
    }

    /// Raw completion of a text prompt, no chat template.
    pub fn complete(&self, prompt: &str) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            prompt: prompt.to_string(),
            stop_strings: Vec::new(),
            config: GenerationConfig::default(),
        }
    }

    /// Chat completion: renders the conversation with the Phi-3
    /// instruct template and generates the assistant's reply.
    pub fn chat(&self, messages: &[ChatMessage]) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            prompt: chat_prompt(messages),
            stop_strings: vec!["<|end|>".to_string()],
            config: GenerationConfig {
                max_new_tokens: 1024,
                ..Default::default()
            },
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Role of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System instructions.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Who is speaking.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Render a conversation in the Phi-3 instruct format and cue the
/// model for the assistant's next turn.
fn chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let tag = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        prompt.push_str(&format!("<|{tag}|>\n{}<|end|>\n", message.content));
    }
    prompt.push_str("<|assistant|>");
    prompt
}

/// A generation request; consumed by [`GenerateRequest::execute`] or
/// [`GenerateRequest::stream`].
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    prompt: String,
    stop_strings: Vec<String>,
    config: GenerationConfig,
}

impl<'a> GenerateRequest<'a> {
    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_new_tokens = n;
        self
    }

    /// Set temperature; `0` selects greedy decoding.
    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t;
        self
    }

    /// Set the nucleus sampling threshold.
    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p;
        self
    }

    /// Set the sampling seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Add a stop string.
    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.stop_strings.push(stop.into());
        self
    }

    /// Include the prompt in the result text.
    pub fn echo(mut self, echo: bool) -> Self {
        self.config.echo = echo;
        self
    }

    /// Run the generation to completion.
    pub fn execute(self) -> Result<GenerateResult> {
        let stops: Vec<&str> = self.stop_strings.iter().map(String::as_str).collect();
        let output = self
            .engine
            .pipeline
            .generate_prompt(&self.prompt, &stops, &self.config)?;
        GenerateResult::from_output(&self.engine.pipeline, &output, self.config.echo)
    }

    /// Run the generation, passing each decoded text fragment to
    /// `on_text` as it is produced.
    pub fn stream<F>(self, mut on_text: F) -> Result<GenerateResult>
    where
        F: FnMut(&str),
    {
        let stops: Vec<&str> = self.stop_strings.iter().map(String::as_str).collect();
        let output = self.engine.pipeline.generate_stream(
            &self.prompt,
            &stops,
            &self.config,
            |fragment| {
                on_text(fragment);
                Ok(())
            },
        )?;
        GenerateResult::from_output(&self.engine.pipeline, &output, self.config.echo)
    }
}

/// Result of text generation.
#[derive(Debug)]
pub struct GenerateResult {
    /// Generated text.
    pub text: String,
    /// Generated token ids (prompt excluded).
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
    /// Whether generation hit a stop sequence or ran out of budget.
    pub stop_reason: StopReason,
}

impl GenerateResult {
    fn from_output(pipeline: &Pipeline, output: &GenerationOutput, echo: bool) -> Result<Self> {
        let row = &output.tokens[0];
        let tokens = row[output.prompt_len..].to_vec();
        Ok(Self {
            text: pipeline.decode_output(output, echo)?,
            num_prompt_tokens: output.prompt_len,
            num_generated_tokens: tokens.len(),
            tokens,
            stop_reason: output.stop_reasons[0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::Path;
    use strata_core::model::ModelConfig;

    const TOY_TOKENIZER: &str = r#"{
        "version": "1.0",
        "added_tokens": [
            {"id": 0, "content": "<s>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "pre_tokenizer": {"type": "Whitespace"},
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<s>": 0, "<unk>": 1, "<|endoftext|>": 2, "t3": 3,
                "t4": 4, "t5": 5, "t6": 6, "t7": 7
            },
            "unk_token": "<unk>"
        }
    }"#;

    fn toy_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 8,
            hidden_size: 4,
            intermediate_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            num_key_value_heads: Some(2),
            max_position_embeddings: 16,
            original_max_position_embeddings: Some(16),
            ..Default::default()
        }
    }

    /// Write a complete toy model directory: config, tokenizer and a
    /// single-shard checkpoint.
    fn toy_model_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("strata_engine_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let config = toy_config();
        let config_json = serde_json::to_string(&config).unwrap();
        std::fs::write(dir.join("config.json"), config_json).unwrap();

        let mut file = std::fs::File::create(dir.join("tokenizer.json")).unwrap();
        file.write_all(TOY_TOKENIZER.as_bytes()).unwrap();

        let device = Device::Cpu;
        let randn = |shape: &[usize]| Tensor::randn(0.0f32, 0.02, shape, &device).unwrap();
        let ones = || Tensor::ones(config.hidden_size, candle_core::DType::F32, &device).unwrap();
        let qkv_size = (config.num_attention_heads + 2 * config.num_kv_heads()) * config.head_dim();

        let mut tensors = HashMap::new();
        tensors.insert(
            "model.embed_tokens.weight".to_string(),
            randn(&[config.vocab_size, config.hidden_size]),
        );
        for idx in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{idx}");
            tensors.insert(format!("{prefix}.input_layernorm.weight"), ones());
            tensors.insert(
                format!("{prefix}.self_attn.qkv_proj.weight"),
                randn(&[qkv_size, config.hidden_size]),
            );
            tensors.insert(
                format!("{prefix}.self_attn.o_proj.weight"),
                randn(&[config.hidden_size, config.hidden_size]),
            );
            tensors.insert(format!("{prefix}.post_attention_layernorm.weight"), ones());
            tensors.insert(
                format!("{prefix}.mlp.gate_up_proj.weight"),
                randn(&[2 * config.intermediate_size, config.hidden_size]),
            );
            tensors.insert(
                format!("{prefix}.mlp.down_proj.weight"),
                randn(&[config.hidden_size, config.intermediate_size]),
            );
        }
        tensors.insert("model.norm.weight".to_string(), ones());
        tensors.insert(
            "lm_head.weight".to_string(),
            randn(&[config.vocab_size, config.hidden_size]),
        );
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();

        dir
    }

    fn cleanup(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn chat_prompt_follows_the_instruct_template() {
        let messages = [
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello!"),
            ChatMessage::assistant("Hi, how can I help?"),
            ChatMessage::user("What is 2+2?"),
        ];
        let prompt = chat_prompt(&messages);
        assert_eq!(
            prompt,
            "<|system|>\nYou are a helpful assistant.<|end|>\n\
             <|user|>\nHello!<|end|>\n\
             <|assistant|>\nHi, how can I help?<|end|>\n\
             <|user|>\nWhat is 2+2?<|end|>\n\
             <|assistant|>"
        );
    }

    #[test]
    fn builder_defaults_are_cpu_f32() {
        let builder = EngineBuilder::new();
        assert_eq!(builder.config.device, "cpu");
        assert_eq!(builder.config.dtype, DType::F32);
        assert!(builder.config.memory_budget_bytes.is_none());
        assert!(builder.config.quantization.is_none());
    }

    #[test]
    fn engine_builds_and_completes() {
        let dir = toy_model_dir("completes");
        let engine = Engine::builder().model_dir(&dir).build().unwrap();

        let result = engine
            .complete("t3 t4")
            .max_tokens(3)
            .temperature(0.0)
            .execute()
            .unwrap();
        assert!(result.num_generated_tokens >= 1);
        assert!(result.num_generated_tokens <= 3);
        assert_eq!(result.num_prompt_tokens, 3);
        assert_eq!(result.tokens.len(), result.num_generated_tokens);

        cleanup(&dir);
    }

    #[test]
    fn chat_runs_the_template_through_the_pipeline() {
        let dir = toy_model_dir("chat");
        let engine = Engine::builder().model_dir(&dir).build().unwrap();

        let result = engine
            .chat(&[ChatMessage::user("t3")])
            .max_tokens(2)
            .temperature(0.0)
            .execute()
            .unwrap();
        assert!(result.num_generated_tokens >= 1);
        // The template tokens all map to <unk> in the toy vocabulary,
        // but the prompt must still be non-trivial.
        assert!(result.num_prompt_tokens > 1);

        cleanup(&dir);
    }

    #[test]
    fn budgeted_engine_stages_layers_and_still_generates() {
        let dir = toy_model_dir("budgeted");
        // One byte of budget forces every layer onto the storage tier.
        let engine = Engine::builder()
            .model_dir(&dir)
            .memory_budget_bytes(1)
            .build()
            .unwrap();

        let staged = (0..engine.model().num_layers())
            .filter(|&idx| engine.model().residency(idx) == Residency::NeedsLoad)
            .count();
        assert_eq!(staged, engine.model().num_layers());

        let result = engine
            .complete("t3 t4")
            .max_tokens(2)
            .temperature(0.0)
            .execute()
            .unwrap();
        assert!(result.num_generated_tokens >= 1);

        cleanup(&dir);
    }

    #[test]
    fn quantized_engine_generates() {
        let dir = toy_model_dir("quantized");
        let engine = Engine::builder()
            .model_dir(&dir)
            .quantization(QuantMode::Int8)
            .build()
            .unwrap();

        let result = engine
            .complete("t3 t4")
            .max_tokens(2)
            .temperature(0.0)
            .execute()
            .unwrap();
        assert!(result.num_generated_tokens >= 1);

        cleanup(&dir);
    }

    #[test]
    fn streaming_matches_execute() {
        let dir = toy_model_dir("streaming");
        let engine = Engine::builder().model_dir(&dir).build().unwrap();

        let mut collected = String::new();
        let streamed = engine
            .complete("t3 t4")
            .max_tokens(3)
            .temperature(0.0)
            .stream(|fragment| collected.push_str(fragment))
            .unwrap();
        assert_eq!(collected, streamed.text);

        let executed = engine
            .complete("t3 t4")
            .max_tokens(3)
            .temperature(0.0)
            .execute()
            .unwrap();
        assert_eq!(streamed.text, executed.text);
        assert_eq!(streamed.tokens, executed.tokens);

        cleanup(&dir);
    }
}
