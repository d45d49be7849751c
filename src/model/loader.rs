use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, api::sync::ApiBuilder, api::sync::ApiRepo, Repo, RepoType};
use tracing::info;

use super::{
    LanguageModel, LoraAdapter, ModelHandle, ModelLoader, QuantizationConfig, Qwen2Config,
    Qwen2Model,
};
use crate::config::ModelSource;
use crate::device::{device_info, select_device, CapabilityConfig};
use crate::error::{InferenceError, Result};
use crate::tokenizer::{PromptTokenizer, TokenizerWrapper};

pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Download (or reuse from the local hub cache) the base model files.
pub fn fetch_model_files(source: &ModelSource) -> Result<ModelFiles> {
    info!(
        "Fetching model: {} (revision: {})",
        source.model_id, source.revision
    );

    let api = match source.hf_token.as_deref() {
        Some(t) => ApiBuilder::new()
            .with_token(Some(t.to_string()))
            .build()
            .map_err(|e| InferenceError::Hub(e.to_string()))?,
        None => Api::new().map_err(|e| InferenceError::Hub(e.to_string()))?,
    };

    let repo = api.repo(Repo::with_revision(
        source.model_id.clone(),
        RepoType::Model,
        source.revision.clone(),
    ));

    let config = repo
        .get("config.json")
        .map_err(|e| InferenceError::Hub(format!("Failed to download config.json: {}", e)))?;

    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| InferenceError::Hub(format!("Failed to download tokenizer.json: {}", e)))?;

    let weights = download_weights(&repo)?;

    info!(
        "Model files ready: config={:?}, tokenizer={:?}, weights={} files",
        config,
        tokenizer,
        weights.len()
    );

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index = repo.get("model.safetensors.index.json").map_err(|e| {
        InferenceError::Hub(format!(
            "Could not find model weights (tried model.safetensors and a sharded index): {}",
            e
        ))
    })?;
    let shards = shard_names(&std::fs::read_to_string(index)?)?;

    shards
        .iter()
        .map(|shard| {
            repo.get(shard)
                .map_err(|e| InferenceError::Hub(format!("Failed to download {}: {}", shard, e)))
        })
        .collect()
}

/// Distinct shard file names listed in a safetensors index, in order.
fn shard_names(index_json: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| InferenceError::Hub("safetensors index has no weight_map".to_string()))?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

/// Read every base weight. With `low_memory` the shards are memory-mapped
/// and each tensor goes straight to `device`; otherwise whole files are read
/// into host memory first.
fn load_base_weights(
    paths: &[PathBuf],
    device: &Device,
    low_memory: bool,
) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    if low_memory {
        let mmaped = unsafe { MmapedSafetensors::multi(paths)? };
        for (name, _) in mmaped.tensors() {
            let tensor = mmaped.load(&name, device)?;
            tensors.insert(name, tensor);
        }
    } else {
        for path in paths {
            tensors.extend(candle_core::safetensors::load(path, device)?);
        }
    }
    Ok(tensors)
}

/// Loads the base model from the hub and attaches the local adapter.
pub struct HubModelLoader {
    source: ModelSource,
}

impl HubModelLoader {
    pub fn new(source: ModelSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }
}

impl ModelLoader for HubModelLoader {
    fn load(&self, capability: CapabilityConfig) -> Result<ModelHandle> {
        info!("Loading model with {:?}", capability);
        let files = fetch_model_files(&self.source)?;

        let tokenizer = TokenizerWrapper::load(&files.tokenizer)?.pad_with_eos()?;

        let quantization = capability.quantize.then(QuantizationConfig::default);

        let device = select_device(capability.use_accelerator);
        let dtype = if capability.use_accelerator {
            DType::F16
        } else {
            DType::F32
        };
        // quantization happens on the host, so weights stay there until packed
        let weights_device = if quantization.is_some() {
            Device::Cpu
        } else {
            device.clone()
        };
        info!(
            "Loading base weights onto {} (low memory: {})",
            device_info(&weights_device),
            capability.use_accelerator
        );
        let config = Qwen2Config::from_file(&files.config)?;
        let mut weights =
            load_base_weights(&files.weights, &weights_device, capability.use_accelerator)?;

        let adapter = LoraAdapter::load(&self.source.adapter_path)?;
        adapter.warn_on_base_mismatch(&self.source.model_id);
        adapter.merge_into(&mut weights)?;

        let model: Box<dyn LanguageModel> = match quantization {
            Some(quantization) => build_quantized(&config, weights, &quantization, &device)?,
            None => Box::new(Qwen2Model::build(&config, weights, dtype, &device)?),
        };

        let eos = tokenizer.eos_token_id().unwrap_or(config.eos_token_id);
        let pad = tokenizer.pad_token_id().unwrap_or(eos);
        info!(
            "Model ready on {} (eos={}, vocab={})",
            device_info(&device),
            eos,
            tokenizer.vocab_size()
        );

        Ok(ModelHandle::new(Arc::new(tokenizer), model, device).with_pad_token_id(pad))
    }
}

#[cfg(feature = "quantized")]
fn build_quantized(
    config: &Qwen2Config,
    weights: HashMap<String, Tensor>,
    quantization: &QuantizationConfig,
    device: &Device,
) -> Result<Box<dyn LanguageModel>> {
    Ok(Box::new(super::QuantizedQwen2Model::build(
        config,
        weights,
        quantization,
        device,
    )?))
}

#[cfg(not(feature = "quantized"))]
fn build_quantized(
    _config: &Qwen2Config,
    _weights: HashMap<String, Tensor>,
    _quantization: &QuantizationConfig,
    _device: &Device,
) -> Result<Box<dyn LanguageModel>> {
    Err(InferenceError::ModelLoad(
        "4-bit quantization requested but this build has no quantization backend".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_are_deduplicated_and_sorted() {
        let index = r#"{
            "metadata": {"total_size": 10},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        }"#;
        assert_eq!(
            shard_names(index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn index_without_weight_map_is_rejected() {
        assert!(shard_names("{}").is_err());
    }

    #[test]
    fn both_weight_loading_modes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let tensors = HashMap::from([(
            "model.norm.weight".to_string(),
            Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap(),
        )]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let paths = vec![path];
        let mapped = load_base_weights(&paths, &Device::Cpu, true).unwrap();
        let read = load_base_weights(&paths, &Device::Cpu, false).unwrap();

        let a: Vec<f32> = mapped["model.norm.weight"].to_vec1().unwrap();
        let b: Vec<f32> = read["model.norm.weight"].to_vec1().unwrap();
        assert_eq!(a, vec![1., 2., 3.]);
        assert_eq!(a, b);
    }
}
