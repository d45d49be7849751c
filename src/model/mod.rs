mod adapter;
mod loader;
#[cfg(feature = "quantized")]
mod quantized;
mod qwen2;

pub use adapter::{AdapterConfig, LoraAdapter};
pub use loader::{fetch_model_files, HubModelLoader, ModelFiles};
#[cfg(feature = "quantized")]
pub use quantized::{gguf_tensor_name, QuantizedQwen2Model};
pub use qwen2::{Qwen2Config, Qwen2Model};

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::device::{device_info, CapabilityConfig};
use crate::error::Result;
use crate::tokenizer::PromptTokenizer;

/// Trait for language models that can generate next token logits
pub trait LanguageModel: Send + Sync {
    /// Forward pass to get logits for the next token
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor>;

    /// Reset the model's KV cache
    fn reset_cache(&mut self);

    /// An independent decoding state over the same weights. The shared
    /// handle is never run directly; every request decodes on a fork.
    fn fork(&self) -> Box<dyn LanguageModel>;

    /// Get the end-of-sequence token ID
    fn eos_token_id(&self) -> u32;
}

/// Produces a ready handle from a capability record.
pub trait ModelLoader: Send + Sync {
    fn load(&self, capability: CapabilityConfig) -> Result<ModelHandle>;
}

/// 4-bit weight settings, built only when the probe allows quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationConfig {
    pub bits: u8,
    pub double_quant: bool,
    pub quant_type: QuantType,
    pub compute_dtype: DType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantType {
    /// 4-bit k-quants: 256-value super-blocks whose per-block scales are
    /// themselves quantized.
    Q4K,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            double_quant: true,
            quant_type: QuantType::Q4K,
            compute_dtype: DType::F16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationDefaults {
    pub eos_token_id: u32,
    pub pad_token_id: Option<u32>,
}

/// A loaded tokenizer/model pair. Read-only once published.
pub struct ModelHandle {
    pub tokenizer: Arc<dyn PromptTokenizer>,
    pub model: Box<dyn LanguageModel>,
    pub device: Device,
    pub generation: GenerationDefaults,
}

impl ModelHandle {
    pub fn new(
        tokenizer: Arc<dyn PromptTokenizer>,
        model: Box<dyn LanguageModel>,
        device: Device,
    ) -> Self {
        let eos_token_id = tokenizer.eos_token_id().unwrap_or(model.eos_token_id());
        Self {
            tokenizer,
            model,
            device,
            generation: GenerationDefaults {
                eos_token_id,
                pad_token_id: None,
            },
        }
    }

    pub fn with_pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.generation.pad_token_id = Some(pad_token_id);
        self
    }

    pub fn device_name(&self) -> String {
        device_info(&self.device)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("device", &self.device_name())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
