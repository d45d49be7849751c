use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::{Config, ModelForCausalLM};
use tracing::info;

use super::LanguageModel;
use crate::error::Result;

/// `config.json` of a Qwen2 checkpoint plus the EOS id candle's config drops.
#[derive(Debug, Clone)]
pub struct Qwen2Config {
    pub arch: Config,
    pub eos_token_id: u32,
}

impl Qwen2Config {
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)?;
        Self::from_json(&config_str)
    }

    pub fn from_json(config_str: &str) -> Result<Self> {
        let arch: Config = serde_json::from_str(config_str)?;

        let config_json: serde_json::Value = serde_json::from_str(config_str)?;
        let eos_token_id = config_json
            .get("eos_token_id")
            .and_then(|v| {
                v.as_u64().or_else(|| v.as_array().and_then(|arr| arr.first()?.as_u64()))
            })
            .unwrap_or(151643) as u32;

        info!(
            "Qwen2 config: vocab_size={}, hidden_size={}, num_layers={}, num_heads={}",
            arch.vocab_size, arch.hidden_size, arch.num_hidden_layers, arch.num_attention_heads
        );

        Ok(Self { arch, eos_token_id })
    }
}

#[derive(Clone)]
pub struct Qwen2Model {
    model: ModelForCausalLM,
    eos_token_id: u32,
}

impl Qwen2Model {
    /// Build from an already adapter-merged weight map.
    pub fn build(
        config: &Qwen2Config,
        tensors: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!("Building Qwen2 model ({:?})...", dtype);
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        let model = ModelForCausalLM::new(&config.arch, vb)?;

        info!("Qwen2 model built");
        Ok(Self {
            model,
            eos_token_id: config.eos_token_id,
        })
    }
}

impl LanguageModel for Qwen2Model {
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        let logits = self.model.forward(input_ids, position)?;
        Ok(logits)
    }

    fn reset_cache(&mut self) {
        self.model.clear_kv_cache();
    }

    fn fork(&self) -> Box<dyn LanguageModel> {
        let mut fork = self.clone();
        fork.reset_cache();
        Box::new(fork)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}
