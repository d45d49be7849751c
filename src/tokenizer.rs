use std::path::Path;

use tokenizers::{PaddingParams, Tokenizer};
use tracing::info;

use crate::error::{InferenceError, Result};

/// The text <-> token id capability the solver needs.
pub trait PromptTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode, dropping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;
}

pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading tokenizer from {:?}", path);
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

        info!("Tokenizer loaded with {} tokens", tokenizer.get_vocab_size(true));
        Ok(Self { tokenizer })
    }

    /// The base model ships without a dedicated pad token; reuse EOS.
    pub fn pad_with_eos(mut self) -> Result<Self> {
        let eos = self
            .eos_token_id()
            .ok_or_else(|| InferenceError::Tokenizer("tokenizer has no EOS token".to_string()))?;
        let pad_token = self
            .tokenizer
            .id_to_token(eos)
            .ok_or_else(|| InferenceError::Tokenizer(format!("unknown EOS id {}", eos)))?;

        self.tokenizer.with_padding(Some(PaddingParams {
            pad_id: eos,
            pad_token,
            ..Default::default()
        }));
        Ok(self)
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.tokenizer.get_padding().map(|p| p.pad_id)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl PromptTokenizer for TokenizerWrapper {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.tokenizer
            .token_to_id("<|endoftext|>")
            .or_else(|| self.tokenizer.token_to_id("</s>"))
            .or_else(|| self.tokenizer.token_to_id("<eos>"))
    }
}
