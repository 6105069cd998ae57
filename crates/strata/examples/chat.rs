//! Chat example.
//!
//! Loads a Phi-3 instruct checkpoint and streams a chat reply.
//!
//! Run with:
//! ```bash
//! cargo run --release -p strata --example chat -- /path/to/phi-3-mini
//! ```

use anyhow::Result;
use std::io::Write;
use strata::prelude::*;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let model_dir = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("models/phi-3-mini-4k-instruct");

    // Build engine; cap the compute device at 2 GiB so oversized
    // models still load, with the overflow staged from storage.
    let engine = Engine::builder()
        .model_dir(model_dir)
        .memory_budget_bytes(2 << 30)
        .build()?;

    println!("Engine initialized on {}", engine.config().device);

    let messages = [
        ChatMessage::system("You are a concise assistant."),
        ChatMessage::user("What does a KV cache store, in one sentence?"),
    ];

    print!("Assistant: ");
    let result = engine
        .chat(&messages)
        .max_tokens(256)
        .temperature(0.7)
        .stream(|fragment| {
            print!("{fragment}");
            let _ = std::io::stdout().flush();
        })?;

    println!("\n");
    println!(
        "Generated {} tokens ({:?})",
        result.num_generated_tokens, result.stop_reason
    );

    Ok(())
}
