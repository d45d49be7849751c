//! 4-bit weights for the accelerator path.
//!
//! The adapter-merged safetensors weights are quantized in memory and packed
//! as a GGUF image, which is then read back tensor by tensor onto the target
//! device. The graph below keeps those weights behind one `Arc`; a session
//! only owns its KV cache, so forking copies no weights.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use candle_core::quantized::{gguf_file, GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::rotary_emb::rope;
use candle_nn::{ops, Embedding};
use candle_transformers::utils::repeat_kv;
use tracing::info;

use super::qwen2::Qwen2Config;
use super::{LanguageModel, QuantType, QuantizationConfig};
use crate::error::{InferenceError, Result};

const ARCH: &str = "qwen2";

struct QLinear {
    weight: QMatMul,
    bias: Option<Tensor>,
}

impl QLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.weight.forward(xs)?;
        match &self.bias {
            Some(bias) => Ok(ys.broadcast_add(bias)?),
            None => Ok(ys),
        }
    }
}

struct Block {
    attn_norm: Tensor,
    q_proj: QLinear,
    k_proj: QLinear,
    v_proj: QLinear,
    o_proj: QLinear,
    ffn_norm: Tensor,
    gate_proj: QLinear,
    up_proj: QLinear,
    down_proj: QLinear,
}

/// Read-only part of the model, shared by every session.
struct Weights {
    embed_tokens: Embedding,
    blocks: Vec<Block>,
    norm: Tensor,
    output: QMatMul,
    cos: Tensor,
    sin: Tensor,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rms_norm_eps: f32,
    device: Device,
}

type KvCache = Option<(Tensor, Tensor)>;

pub struct QuantizedQwen2Model {
    weights: Arc<Weights>,
    kv_cache: Vec<KvCache>,
    eos_token_id: u32,
}

impl QuantizedQwen2Model {
    pub fn build(
        config: &Qwen2Config,
        tensors: HashMap<String, Tensor>,
        quantization: &QuantizationConfig,
        device: &Device,
    ) -> Result<Self> {
        if quantization.bits != 4 {
            return Err(InferenceError::Config(format!(
                "unsupported quantization width: {} bits",
                quantization.bits
            )));
        }
        info!(
            "Quantizing weights ({:?}, double quant: {}, compute dtype: {:?})...",
            quantization.quant_type, quantization.double_quant, quantization.compute_dtype
        );

        let image = pack_gguf(tensors, quantization)?;
        let mut reader = Cursor::new(image);
        let content = gguf_file::Content::read(&mut reader)?;
        let weights = Weights::from_gguf(config, &content, &mut reader, device)?;
        let kv_cache = vec![None; weights.blocks.len()];

        info!("Quantized Qwen2 model built");
        Ok(Self {
            weights: Arc::new(weights),
            kv_cache,
            eos_token_id: config.eos_token_id,
        })
    }
}

impl LanguageModel for QuantizedQwen2Model {
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        if position == 0 {
            self.reset_cache();
        }
        self.weights.forward(input_ids, position, &mut self.kv_cache)
    }

    fn reset_cache(&mut self) {
        self.kv_cache.iter_mut().for_each(|cache| *cache = None);
    }

    fn fork(&self) -> Box<dyn LanguageModel> {
        Box::new(Self {
            weights: Arc::clone(&self.weights),
            kv_cache: vec![None; self.kv_cache.len()],
            eos_token_id: self.eos_token_id,
        })
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

impl Weights {
    fn from_gguf(
        config: &Qwen2Config,
        content: &gguf_file::Content,
        reader: &mut Cursor<Vec<u8>>,
        device: &Device,
    ) -> Result<Self> {
        let arch = &config.arch;
        let mut load = |name: &str| -> Result<QTensor> { Ok(content.tensor(&mut *reader, name, device)?) };

        let embed = load("token_embd.weight")?.dequantize(device)?;
        let norm = load("output_norm.weight")?.dequantize(device)?;
        let output = QMatMul::from_qtensor(load("output.weight")?)?;

        let mut blocks = Vec::with_capacity(arch.num_hidden_layers);
        for layer in 0..arch.num_hidden_layers {
            let prefix = format!("blk.{layer}");
            let mut linear = |module: &str, with_bias: bool| -> Result<QLinear> {
                let weight = QMatMul::from_qtensor(load(&format!("{prefix}.{module}.weight"))?)?;
                let bias = if with_bias {
                    Some(load(&format!("{prefix}.{module}.bias"))?.dequantize(device)?)
                } else {
                    None
                };
                Ok(QLinear { weight, bias })
            };
            let q_proj = linear("attn_q", true)?;
            let k_proj = linear("attn_k", true)?;
            let v_proj = linear("attn_v", true)?;
            let o_proj = linear("attn_output", false)?;
            let gate_proj = linear("ffn_gate", false)?;
            let up_proj = linear("ffn_up", false)?;
            let down_proj = linear("ffn_down", false)?;
            blocks.push(Block {
                attn_norm: load(&format!("{prefix}.attn_norm.weight"))?.dequantize(device)?,
                q_proj,
                k_proj,
                v_proj,
                o_proj,
                ffn_norm: load(&format!("{prefix}.ffn_norm.weight"))?.dequantize(device)?,
                gate_proj,
                up_proj,
                down_proj,
            });
        }

        let head_dim = arch.hidden_size / arch.num_attention_heads;
        let (cos, sin) = rope_tables(
            head_dim,
            arch.max_position_embeddings,
            arch.rope_theta as f32,
            device,
        )?;

        Ok(Self {
            embed_tokens: Embedding::new(embed, arch.hidden_size),
            blocks,
            norm,
            output,
            cos,
            sin,
            num_heads: arch.num_attention_heads,
            num_kv_heads: arch.num_key_value_heads,
            head_dim,
            rms_norm_eps: arch.rms_norm_eps as f32,
            device: device.clone(),
        })
    }

    /// Logits of the last input position, shape `(batch, vocab)`.
    fn forward(&self, input_ids: &Tensor, position: usize, kv_cache: &mut [KvCache]) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let cos = self.cos.narrow(0, position, seq_len)?.contiguous()?;
        let sin = self.sin.narrow(0, position, seq_len)?.contiguous()?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, position, &self.device)?)
        } else {
            None
        };

        let mut xs = self.embed_tokens.forward(input_ids)?;
        for (block, cache) in self.blocks.iter().zip(kv_cache.iter_mut()) {
            let hidden = ops::rms_norm(&xs, &block.attn_norm, self.rms_norm_eps)?;
            let hidden = self.attention(block, &hidden, cache, &cos, &sin, mask.as_ref())?;
            xs = (&xs + hidden)?;

            let hidden = ops::rms_norm(&xs, &block.ffn_norm, self.rms_norm_eps)?;
            let gate = ops::silu(&block.gate_proj.forward(&hidden)?)?;
            let hidden = block.down_proj.forward(&(gate * block.up_proj.forward(&hidden)?)?)?;
            xs = (&xs + hidden)?;
        }

        let xs = ops::rms_norm(&xs, &self.norm, self.rms_norm_eps)?;
        let last = xs.narrow(1, seq_len - 1, 1)?.squeeze(1)?.contiguous()?;
        Ok(self.output.forward(&last)?)
    }

    fn attention(
        &self,
        block: &Block,
        xs: &Tensor,
        cache: &mut KvCache,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        let heads = |xs: Tensor, n: usize| -> Result<Tensor> {
            Ok(xs
                .reshape((batch, seq_len, n, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        let q = heads(block.q_proj.forward(xs)?, self.num_heads)?;
        let k = heads(block.k_proj.forward(xs)?, self.num_kv_heads)?;
        let v = heads(block.v_proj.forward(xs)?, self.num_kv_heads)?;

        let q = rope(&q, cos, sin)?;
        let k = rope(&k, cos, sin)?;

        let (k, v) = match cache.take() {
            Some((prev_k, prev_v)) => (Tensor::cat(&[&prev_k, &k], 2)?, Tensor::cat(&[&prev_v, &v], 2)?),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1f64 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = ops::softmax_last_dim(&scores)?;
        let ys = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        block.o_proj.forward(&ys)
    }
}

fn rope_tables(head_dim: usize, max_positions: usize, theta: f32, device: &Device) -> Result<(Tensor, Tensor)> {
    let inv_freq: Vec<f32> = (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f32 / head_dim as f32))
        .collect();
    let half = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions = Tensor::arange(0u32, max_positions as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((max_positions, 1))?;
    let freqs = positions.matmul(&inv_freq)?;
    Ok((freqs.cos()?, freqs.sin()?))
}

/// `(seq_len, position + seq_len)`: query `i` sees keys up to `position + i`.
fn causal_mask(seq_len: usize, position: usize, device: &Device) -> Result<Tensor> {
    let total = position + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > position + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, total), device)?)
}

fn pack_gguf(mut tensors: HashMap<String, Tensor>, quantization: &QuantizationConfig) -> Result<Vec<u8>> {
    // tied embeddings: the graph expects an explicit output matrix
    if !tensors.contains_key("lm_head.weight") {
        if let Some(embed) = tensors.get("model.embed_tokens.weight") {
            let embed = embed.clone();
            tensors.insert("lm_head.weight".to_string(), embed);
        }
    }

    let weight_dtype = match quantization.quant_type {
        QuantType::Q4K => GgmlDType::Q4K,
    };
    let plain_dtype = match quantization.compute_dtype {
        DType::F16 => GgmlDType::F16,
        _ => GgmlDType::F32,
    };

    let mut qtensors = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let Some(gguf_name) = gguf_tensor_name(&name) else {
            continue;
        };
        let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let dtype = if is_quantizable(&gguf_name, &tensor, weight_dtype) {
            weight_dtype
        } else {
            plain_dtype
        };
        qtensors.push((gguf_name, QTensor::quantize(&tensor, dtype)?));
    }

    let architecture = gguf_file::Value::String(ARCH.to_string());
    let metadata = [("general.architecture", &architecture)];
    let tensor_refs: Vec<(&str, &QTensor)> =
        qtensors.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let mut image = Cursor::new(Vec::new());
    gguf_file::write(&mut image, &metadata, &tensor_refs)?;
    Ok(image.into_inner())
}

/// Only 2D projection matrices whose rows fill whole blocks are quantized.
fn is_quantizable(gguf_name: &str, tensor: &Tensor, dtype: GgmlDType) -> bool {
    let dims = tensor.dims();
    gguf_name.ends_with(".weight")
        && !gguf_name.contains("norm")
        && dims.len() == 2
        && dims[1] % dtype.block_size() == 0
}

/// Hugging Face Qwen2 parameter name to its GGUF counterpart.
pub fn gguf_tensor_name(hf_name: &str) -> Option<String> {
    match hf_name {
        "model.embed_tokens.weight" => return Some("token_embd.weight".to_string()),
        "model.norm.weight" => return Some("output_norm.weight".to_string()),
        "lm_head.weight" => return Some("output.weight".to_string()),
        _ => {}
    }

    let rest = hf_name.strip_prefix("model.layers.")?;
    let (layer, param) = rest.split_once('.')?;
    let layer: usize = layer.parse().ok()?;

    let (module, kind) = param.rsplit_once('.')?;
    let gguf_module = match module {
        "input_layernorm" => "attn_norm",
        "post_attention_layernorm" => "ffn_norm",
        "self_attn.q_proj" => "attn_q",
        "self_attn.k_proj" => "attn_k",
        "self_attn.v_proj" => "attn_v",
        "self_attn.o_proj" => "attn_output",
        "mlp.gate_proj" => "ffn_gate",
        "mlp.up_proj" => "ffn_up",
        "mlp.down_proj" => "ffn_down",
        _ => return None,
    };
    Some(format!("blk.{}.{}.{}", layer, gguf_module, kind))
}
