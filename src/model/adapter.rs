//! LoRA adapter attachment.
//!
//! A LoRA adapter stores, for each targeted linear layer, a down projection
//! `A: [r, in]` and an up projection `B: [out, r]`. Attaching it folds the
//! low-rank update into an in-memory copy of the base weight:
//!
//!   W' = W + scale * (B @ A),  scale = alpha / r  (alpha / sqrt(r) with rsLoRA)
//!
//! The weight files on disk are left untouched.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{InferenceError, Result};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";
const LORA_A_SUFFIX: &str = ".lora_A.weight";
const LORA_B_SUFFIX: &str = ".lora_B.weight";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    pub fn scale(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

/// One low-rank update, keyed by the base weight it modifies.
struct LoraPair {
    a: Tensor,
    b: Tensor,
}

pub struct LoraAdapter {
    config: AdapterConfig,
    pairs: HashMap<String, LoraPair>,
}

impl LoraAdapter {
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        info!("Loading LoRA adapter from {:?}", dir);

        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            InferenceError::Adapter(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let config: AdapterConfig = serde_json::from_str(&config_str)?;

        let tensors = load_adapter_tensors(&weights_path)?;
        Self::from_tensors(config, tensors)
    }

    pub fn from_tensors(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        if config.r == 0 {
            return Err(InferenceError::Adapter("adapter rank must be positive".to_string()));
        }

        let mut a_halves = HashMap::new();
        let mut b_halves = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(target) = target_weight_name(&name, LORA_A_SUFFIX) {
                a_halves.insert(target, tensor);
            } else if let Some(target) = target_weight_name(&name, LORA_B_SUFFIX) {
                b_halves.insert(target, tensor);
            }
        }

        let mut pairs = HashMap::new();
        for (target, a) in a_halves {
            let b = b_halves.remove(&target).ok_or_else(|| {
                InferenceError::Adapter(format!("{} has lora_A but no lora_B", target))
            })?;
            pairs.insert(target, LoraPair { a, b });
        }
        if let Some(orphan) = b_halves.keys().next() {
            return Err(InferenceError::Adapter(format!(
                "{} has lora_B but no lora_A",
                orphan
            )));
        }

        info!(
            "Adapter: r={}, alpha={}, {} target matrices",
            config.r,
            config.lora_alpha,
            pairs.len()
        );
        Ok(Self { config, pairs })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    pub fn warn_on_base_mismatch(&self, base_model: &str) {
        if let Some(trained_on) = &self.config.base_model_name_or_path {
            if trained_on != base_model {
                warn!(
                    "Adapter was trained on {} but base model is {}",
                    trained_on, base_model
                );
            }
        }
    }

    /// Fold every low-rank update into `weights`, keeping each weight's dtype
    /// and device.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<()> {
        let scale = self.config.scale();
        for (target, pair) in &self.pairs {
            let base = weights.get(target).ok_or_else(|| {
                InferenceError::Adapter(format!("base model has no weight named {}", target))
            })?;

            let a = pair.a.to_device(base.device())?.to_dtype(DType::F32)?;
            let b = pair.b.to_device(base.device())?.to_dtype(DType::F32)?;
            let mut delta = (b.matmul(&a)? * scale)?;
            if self.config.fan_in_fan_out {
                delta = delta.t()?;
            }

            if delta.dims() != base.dims() {
                return Err(InferenceError::Adapter(format!(
                    "shape mismatch for {}: base {:?}, adapter update {:?}",
                    target,
                    base.dims(),
                    delta.dims()
                )));
            }

            let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(target.clone(), merged);
        }
        Ok(())
    }
}

fn load_adapter_tensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(InferenceError::Adapter(format!(
            "adapter weights not found at {}",
            path.display()
        )));
    }
    Ok(candle_core::safetensors::load(path, &Device::Cpu)?)
}

/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// becomes `model.layers.0.self_attn.q_proj.weight`.
fn target_weight_name(adapter_key: &str, suffix: &str) -> Option<String> {
    let stem = adapter_key.strip_suffix(suffix)?;
    let stem = stem.strip_prefix(PEFT_PREFIX).unwrap_or(stem);
    Some(format!("{}.weight", stem))
}
