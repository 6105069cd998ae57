//! Interactive text generation from a local checkpoint.
//!
//! Loads a Phi-family model directory (config.json, tokenizer.json,
//! safetensors weights) and streams completions for typed prompts.
//!
//! Run with:
//! ```bash
//! cargo run --release -p strata-core --example text_generation -- /path/to/phi-3-mini
//! ```

use candle_core::{DType, Device};
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;
use strata_core::generation::{GenerationConfig, Pipeline};
use strata_core::model::{Loader, Tokenizer};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let model_dir = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("models/phi-3-mini-4k-instruct");
    let model_path = Path::new(model_dir);

    println!("Text Generation Example");
    println!("=======================\n");

    println!("Loading tokenizer...");
    let tokenizer = Tokenizer::from_dir(model_path)?;
    println!("  Vocab size: {}", tokenizer.vocab_size());
    println!("  BOS token: {:?}", tokenizer.bos_token_id());
    println!("  EOS token: {:?}", tokenizer.eos_token_id());

    #[cfg(feature = "cuda")]
    let (device, dtype) = {
        println!("\nUsing CUDA");
        (Device::new_cuda(0)?, DType::BF16)
    };

    #[cfg(not(feature = "cuda"))]
    let (device, dtype) = {
        println!("\nUsing CPU");
        (Device::Cpu, DType::F32)
    };

    println!("Loading model weights...");
    let load_start = Instant::now();
    let (model, report) = Loader::load_model(model_path, dtype, &device)?;
    println!("Loaded in {:.2}s", load_start.elapsed().as_secs_f64());
    if !report.unexpected.is_empty() {
        println!(
            "  Ignored {} checkpoint tensors not used by the architecture",
            report.unexpected.len()
        );
    }
    println!(
        "Model: {} layers, {} hidden, {:.1} GiB",
        model.num_layers(),
        model.config().hidden_size,
        model.size_in_bytes() as f64 / (1024.0 * 1024.0 * 1024.0)
    );

    let pipeline = Pipeline::new(model, tokenizer);
    let config = GenerationConfig {
        max_new_tokens: 256,
        ..Default::default()
    };

    println!("\n--- Text Generation ---");
    println!("Enter prompts (empty line to quit):\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut prompt = String::new();
        stdin.read_line(&mut prompt)?;
        let prompt = prompt.trim();

        if prompt.is_empty() {
            break;
        }

        let tokens = pipeline.tokenizer().encode(prompt, true)?;
        println!("\n({} prompt tokens)", tokens.len());

        print!("Generated: ");
        stdout.flush()?;

        let gen_start = Instant::now();
        let output = pipeline.generate_stream(prompt, &[], &config, |fragment| {
            print!("{fragment}");
            let _ = io::stdout().flush();
            Ok(())
        })?;

        let gen_time = gen_start.elapsed();
        let new_tokens = output.tokens[0].len() - output.prompt_len;
        println!("\n");
        println!(
            "Generated {} tokens in {:.2}s ({:.1} tok/s)",
            new_tokens,
            gen_time.as_secs_f64(),
            new_tokens as f64 / gen_time.as_secs_f64()
        );
        println!();
    }

    println!("Goodbye!");
    Ok(())
}
