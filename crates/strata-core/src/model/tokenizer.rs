//! Tokenizer integration for text-to-token and token-to-text conversion.
//!
//! Wraps the HuggingFace tokenizers library. The model checkpoint's
//! `tokenizer.json` defines the vocabulary; special token ids are looked
//! up by their conventional names and can be overridden from the model
//! configuration when the vocabulary uses different ones.

use crate::error::{Result, StrataError};
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

/// Tokenizer for encoding text to tokens and decoding tokens to text.
#[derive(Clone)]
pub struct Tokenizer {
    /// Underlying HuggingFace tokenizer.
    inner: HfTokenizer,
    /// BOS token ID.
    bos_token_id: Option<u32>,
    /// EOS token ID.
    eos_token_id: Option<u32>,
    /// PAD token ID.
    pad_token_id: Option<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path.as_ref())
            .map_err(|e| StrataError::TokenizerError(format!("failed to load tokenizer: {}", e)))?;

        let bos_token_id = inner
            .token_to_id("<s>")
            .or_else(|| inner.token_to_id("<|endoftext|>"));
        let eos_token_id = inner
            .token_to_id("<|endoftext|>")
            .or_else(|| inner.token_to_id("</s>"));
        let pad_token_id = inner
            .token_to_id("<pad>")
            .or_else(|| inner.token_to_id("<|endoftext|>"));

        Ok(Self {
            inner,
            bos_token_id,
            eos_token_id,
            pad_token_id,
        })
    }

    /// Load a tokenizer from a model directory's tokenizer.json.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let tokenizer_path = model_dir.as_ref().join("tokenizer.json");
        if !tokenizer_path.is_file() {
            return Err(StrataError::TokenizerError(format!(
                "tokenizer.json not found in {}",
                model_dir.as_ref().display()
            )));
        }
        Self::from_file(tokenizer_path)
    }

    /// Override special token ids, e.g. with values from `config.json`.
    ///
    /// `None` arguments keep the ids found in the vocabulary.
    pub fn with_token_ids(
        mut self,
        bos: Option<u32>,
        eos: Option<u32>,
        pad: Option<u32>,
    ) -> Self {
        if bos.is_some() {
            self.bos_token_id = bos;
        }
        if eos.is_some() {
            self.eos_token_id = eos;
        }
        if pad.is_some() {
            self.pad_token_id = pad;
        }
        self
    }

    /// Encode text to token IDs, optionally prepending the BOS token.
    pub fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| StrataError::TokenizerError(format!("failed to encode text: {}", e)))?;

        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        if add_bos {
            if let Some(bos) = self.bos_token_id {
                ids.insert(0, bos);
            }
        }
        Ok(ids)
    }

    /// Decode token IDs to text.
    pub fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special)
            .map_err(|e| StrataError::TokenizerError(format!("failed to decode tokens: {}", e)))
    }

    /// Decode a single token to text.
    pub fn decode_token(&self, id: u32) -> Result<String> {
        self.decode(&[id], false)
    }

    /// Get vocabulary size (including added tokens).
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Get BOS token ID.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Get EOS token ID.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// Get PAD token ID.
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    /// Check if a token is one of the special tokens.
    pub fn is_special_token(&self, id: u32) -> bool {
        Some(id) == self.bos_token_id
            || Some(id) == self.eos_token_id
            || Some(id) == self.pad_token_id
    }

    /// Token to string (for debugging).
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// String to token ID.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .field("pad_token_id", &self.pad_token_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// Whitespace word-level vocabulary, enough to exercise the wrapper.
    const TOY_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<s>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<s>": 0, "<|endoftext|>": 1, "hello": 2, "world": 3},
            "unk_token": "<|endoftext|>"
        }
    }"#;

    fn write_toy_tokenizer(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strata_tokenizer_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tokenizer.json"), TOY_TOKENIZER).unwrap();
        dir
    }

    #[test]
    fn loads_and_finds_special_tokens() {
        let dir = write_toy_tokenizer("load");
        let tokenizer = Tokenizer::from_dir(&dir).unwrap();

        assert_eq!(tokenizer.bos_token_id(), Some(0));
        assert_eq!(tokenizer.eos_token_id(), Some(1));
        assert!(tokenizer.is_special_token(0));
        assert!(!tokenizer.is_special_token(2));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn encode_round_trip() {
        let dir = write_toy_tokenizer("round_trip");
        let tokenizer = Tokenizer::from_dir(&dir).unwrap();

        let ids = tokenizer.encode("hello world", false).unwrap();
        assert_eq!(ids, vec![2, 3]);

        let with_bos = tokenizer.encode("hello world", true).unwrap();
        assert_eq!(with_bos, vec![0, 2, 3]);

        let decoded = tokenizer.decode(&ids, false).unwrap();
        assert!(decoded.contains("hello"));
        assert!(decoded.contains("world"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn decode_skips_special_tokens() {
        let dir = write_toy_tokenizer("skip_special");
        let tokenizer = Tokenizer::from_dir(&dir).unwrap();

        let decoded = tokenizer.decode(&[0, 2, 1], true).unwrap();
        assert!(!decoded.contains("<s>"));
        assert!(!decoded.contains("<|endoftext|>"));
        assert!(decoded.contains("hello"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn config_ids_override_vocabulary_lookup() {
        let dir = write_toy_tokenizer("override");
        let tokenizer = Tokenizer::from_dir(&dir)
            .unwrap()
            .with_token_ids(None, Some(3), None);

        assert_eq!(tokenizer.bos_token_id(), Some(0));
        assert_eq!(tokenizer.eos_token_id(), Some(3));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_tokenizer_file_is_an_error() {
        let dir = std::env::temp_dir().join("strata_tokenizer_missing");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        assert!(Tokenizer::from_dir(&dir).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    // Run against a real checkpoint:
    // cargo test -p strata-core tokenizer -- --ignored

    #[test]
    #[ignore = "requires model files"]
    fn real_phi3_vocabulary() {
        let tokenizer = Tokenizer::from_dir("models/phi-3-mini-4k-instruct").unwrap();
        println!("Vocab size: {}", tokenizer.vocab_size());
        println!("BOS: {:?}", tokenizer.bos_token_id());
        println!("EOS: {:?}", tokenizer.eos_token_id());

        let text = "Hello, my name is";
        let tokens = tokenizer.encode(text, true).unwrap();
        println!("Tokens: {:?}", tokens);
        assert_eq!(tokens.first().copied(), tokenizer.bos_token_id());

        let decoded = tokenizer.decode(&tokens, true).unwrap();
        assert!(decoded.contains("Hello"));
    }
}
