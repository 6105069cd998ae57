//! Autoregressive generation.
//!
//! [`Pipeline`] owns a model plus its tokenizer and runs the decode
//! loop: forward the prompt once, then feed one sampled token back per
//! step, reusing the KV cache for everything already processed. Stop
//! handling follows the usual contract for instruction-tuned models:
//! the caller's stop sequences are checked against the tail of each
//! row after every step, the tokenizer's end-of-sequence id is always
//! an implicit stop, and the loop ends when every row has stopped or
//! the new-token budget is spent.

pub mod sampler;

pub use sampler::Sampler;

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::error::{Result, StrataError};
use crate::model::{Model, Tokenizer};

/// Knobs for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate beyond the prompt.
    pub max_new_tokens: usize,
    /// Sampling temperature; `<= 0` selects greedy decoding.
    pub temperature: f32,
    /// Top-p (nucleus) sampling threshold.
    pub top_p: f32,
    /// Token-id sequences that end generation for a row when they
    /// appear at its tail. The end-of-sequence id is always added.
    pub stop_sequences: Vec<Vec<u32>>,
    /// RNG seed; generation with the same seed and inputs is
    /// reproducible.
    pub seed: u64,
    /// Include the prompt in text output.
    pub echo: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: Vec::new(),
            seed: 42,
            echo: false,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding (temperature=0).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Sampling with temperature.
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Default::default()
        }
    }
}

/// Why a row stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop sequence (or the end-of-sequence id) appeared at the
    /// row's tail.
    StopSequence,
    /// The new-token budget ran out before any stop sequence matched.
    MaxTokens,
}

/// Result of one generation call.
#[derive(Debug)]
pub struct GenerationOutput {
    /// Full token ids per row, prompt included. Rows stay the same
    /// length: a row that hits a stop sequence early keeps receiving
    /// tokens until every row has stopped.
    pub tokens: Vec<Vec<u32>>,
    /// Logits from the final forward pass, `[batch, last_step, vocab]`
    /// in f32.
    pub logits: Tensor,
    /// Per-row reason the loop ended.
    pub stop_reasons: Vec<StopReason>,
    /// Length of the prompt each row started from.
    pub prompt_len: usize,
}

/// Generation pipeline: tokenizer in, decode loop, tokenizer out.
pub struct Pipeline {
    model: Model,
    tokenizer: Tokenizer,
}

impl Pipeline {
    /// Wrap a model and its tokenizer.
    pub fn new(model: Model, tokenizer: Tokenizer) -> Self {
        Self { model, tokenizer }
    }

    /// The wrapped model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The wrapped tokenizer.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Take the model and tokenizer back out.
    pub fn into_parts(self) -> (Model, Tokenizer) {
        (self.model, self.tokenizer)
    }

    /// Generate token ids from a `[batch, prompt_len]` id tensor.
    ///
    /// `attention_mask` is an optional `[batch, prompt_len]` padding
    /// mask (0 = padded); it grows by one ones-column per generated
    /// token so its width always covers the cached positions.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        self.decode_loop(input_ids, attention_mask, config, None)
    }

    /// Generate from a text prompt. Stop strings are tokenized and
    /// checked alongside `config.stop_sequences`.
    pub fn generate_prompt(
        &self,
        prompt: &str,
        stop_strings: &[&str],
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        let (input_ids, config) = self.prepare_text_call(prompt, stop_strings, config)?;
        self.decode_loop(&input_ids, None, &config, None)
    }

    /// Generate text from a prompt. The returned text covers only the
    /// new tokens unless `config.echo` is set.
    pub fn generate_text(
        &self,
        prompt: &str,
        stop_strings: &[&str],
        config: &GenerationConfig,
    ) -> Result<String> {
        let output = self.generate_prompt(prompt, stop_strings, config)?;
        self.decode_output(&output, config.echo)
    }

    /// Generate from a text prompt, invoking `on_text` with each newly
    /// decoded text fragment as it is produced. An error from the
    /// callback aborts the decode loop.
    pub fn generate_stream<F>(
        &self,
        prompt: &str,
        stop_strings: &[&str],
        config: &GenerationConfig,
        mut on_text: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(&str) -> Result<()>,
    {
        let (input_ids, config) = self.prepare_text_call(prompt, stop_strings, config)?;

        let mut new_ids: Vec<u32> = Vec::new();
        let mut emitted = 0usize;
        let mut observer = |step: &[u32]| -> Result<()> {
            new_ids.push(step[0]);
            let text = self.tokenizer.decode(&new_ids, true)?;
            // Hold back until the decoder produces more bytes ending
            // on a char boundary; a partially decoded multi-byte
            // sequence can stall for a step until the next token
            // completes it.
            if text.len() > emitted {
                if let Some(fragment) = text.get(emitted..) {
                    on_text(fragment)?;
                    emitted = text.len();
                }
            }
            Ok(())
        };

        self.decode_loop(&input_ids, None, &config, Some(&mut observer))
    }

    /// Tokenize a prompt and fold stop strings into the config.
    fn prepare_text_call(
        &self,
        prompt: &str,
        stop_strings: &[&str],
        config: &GenerationConfig,
    ) -> Result<(Tensor, GenerationConfig)> {
        let prompt_ids = self.tokenizer.encode(prompt, true)?;
        if prompt_ids.is_empty() {
            return Err(StrataError::InvalidInput(
                "prompt tokenized to zero tokens".to_string(),
            ));
        }
        let input_ids = Tensor::from_slice(
            &prompt_ids,
            (1, prompt_ids.len()),
            self.model.device(),
        )?;

        let mut config = config.clone();
        for stop in stop_strings {
            let ids = self.tokenizer.encode(stop, false)?;
            if !ids.is_empty() && !config.stop_sequences.contains(&ids) {
                config.stop_sequences.push(ids);
            }
        }
        Ok((input_ids, config))
    }

    /// Decode row 0 of an output to text, covering the whole row when
    /// `echo` is set and only the generated tail otherwise.
    pub fn decode_output(&self, output: &GenerationOutput, echo: bool) -> Result<String> {
        let row = &output.tokens[0];
        let ids = if echo {
            row.as_slice()
        } else {
            &row[output.prompt_len..]
        };
        self.tokenizer.decode(ids, true)
    }

    /// The decode loop shared by all generation entry points.
    ///
    /// The first iteration forwards the whole prompt at cache position
    /// zero; every later iteration forwards exactly the one token
    /// sampled in the previous step. `on_step` (when set) receives the
    /// batch of newly sampled ids after each step.
    fn decode_loop(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: &GenerationConfig,
        mut on_step: Option<&mut dyn FnMut(&[u32]) -> Result<()>>,
    ) -> Result<GenerationOutput> {
        let (batch, prompt_len) = input_ids.dims2()?;
        if prompt_len == 0 {
            return Err(StrataError::InvalidInput(
                "prompt must contain at least one token".to_string(),
            ));
        }
        if let Some(mask) = attention_mask {
            if mask.dims2()? != (batch, prompt_len) {
                return Err(StrataError::ShapeMismatch(format!(
                    "attention mask {:?} does not match input ids [{batch}, {prompt_len}]",
                    mask.dims()
                )));
            }
        }

        let device = self.model.device().clone();
        let total_len = prompt_len + config.max_new_tokens;
        let stops = self.stop_sequences(config);
        debug!(
            batch,
            prompt_len,
            max_new_tokens = config.max_new_tokens,
            "starting decode loop"
        );

        let mut tokens = input_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let mut running_mask = attention_mask.cloned();
        let mut stop_reasons = vec![StopReason::MaxTokens; batch];
        let mut stopped = vec![false; batch];
        let mut sampler = Sampler::new(config.temperature, config.top_p, config.seed);
        let mut cache = self.model.new_cache();
        let mut last_logits: Option<Tensor> = None;

        // A zero-token budget still produces logits for the prompt.
        if total_len == prompt_len {
            let logits =
                self.model
                    .forward(Some(input_ids), None, running_mask.as_ref(), &mut cache)?;
            return Ok(GenerationOutput {
                tokens,
                logits,
                stop_reasons,
                prompt_len,
            });
        }

        let mut prev_pos = 0;
        for cur_pos in prompt_len..total_len {
            let step_len = cur_pos - prev_pos;
            let mut flat = Vec::with_capacity(batch * step_len);
            for row in &tokens {
                flat.extend_from_slice(&row[prev_pos..cur_pos]);
            }
            let step_ids = Tensor::from_slice(&flat, (batch, step_len), &device)?;

            let logits =
                self.model
                    .forward(Some(&step_ids), None, running_mask.as_ref(), &mut cache)?;
            let last = logits.narrow(1, step_len - 1, 1)?.squeeze(1)?;
            let next = sampler.sample(&last)?;

            // Every row receives the sampled token, finished or not,
            // so the batch stays rectangular.
            for (row, &token) in tokens.iter_mut().zip(next.iter()) {
                row.push(token);
            }
            if let Some(mask) = &running_mask {
                let ones = Tensor::ones((batch, 1), mask.dtype(), &device)?;
                running_mask = Some(Tensor::cat(&[mask, &ones], 1)?);
            }
            if let Some(cb) = on_step.as_mut() {
                cb(&next)?;
            }

            for (row, row_tokens) in tokens.iter().enumerate() {
                if stopped[row] {
                    continue;
                }
                if stops.iter().any(|stop| row_tokens.ends_with(stop)) {
                    stopped[row] = true;
                    stop_reasons[row] = StopReason::StopSequence;
                }
            }

            last_logits = Some(logits);
            prev_pos = cur_pos;
            if stopped.iter().all(|&s| s) {
                break;
            }
        }

        let logits = last_logits.ok_or_else(|| {
            StrataError::GenerationError("decode loop ran no forward pass".to_string())
        })?;
        Ok(GenerationOutput {
            tokens,
            logits,
            stop_reasons,
            prompt_len,
        })
    }

    /// Caller stop sequences plus the implicit end-of-sequence stop,
    /// deduplicated; empty sequences are dropped since they would
    /// match any tail.
    fn stop_sequences(&self, config: &GenerationConfig) -> Vec<Vec<u32>> {
        let mut stops: Vec<Vec<u32>> = Vec::with_capacity(config.stop_sequences.len() + 1);
        for stop in &config.stop_sequences {
            if !stop.is_empty() && !stops.contains(stop) {
                stops.push(stop.clone());
            }
        }
        let eos = self
            .tokenizer
            .eos_token_id()
            .or(self.model.config().eos_token_id);
        if let Some(eos) = eos {
            let eos_stop = vec![eos];
            if !stops.contains(&eos_stop) {
                stops.push(eos_stop);
            }
        }
        stops
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("model", &self.model)
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}
