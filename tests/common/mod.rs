#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use candle_core::{Device, Tensor};

use openmath_inference::device::CapabilityConfig;
use openmath_inference::{InferenceError, LanguageModel, ModelHandle, ModelLoader, PromptTokenizer, Result};

pub const EOS: u32 = 256;
pub const ANSWER_WORDS: [&str; 4] = ["15 / 3 = 5 groups.", " Each group costs $1.", " Total: $5.", " The answer is $5."];
const VOCAB: usize = 257 + ANSWER_WORDS.len();

pub fn answer_text() -> String {
    ANSWER_WORDS.concat()
}

/// Bytes map to ids 0..256, EOS is 256 and each canned answer chunk gets its
/// own id after that.
#[derive(Default)]
pub struct ByteTokenizer {
    pub encode_calls: AtomicUsize,
}

impl PromptTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            match id {
                0..=255 => bytes.push(id as u8),
                EOS => {}
                word => {
                    let chunk = ANSWER_WORDS
                        .get((word - 257) as usize)
                        .ok_or_else(|| InferenceError::Tokenizer(format!("unknown id {}", word)))?;
                    bytes.extend_from_slice(chunk.as_bytes());
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS)
    }
}

/// Emits the canned answer chunk by chunk, then EOS.
#[derive(Default)]
pub struct ScriptedModel {
    step: usize,
    pub forward_calls: Arc<AtomicUsize>,
}

impl LanguageModel for ScriptedModel {
    fn forward(&mut self, _input_ids: &Tensor, _position: usize) -> Result<Tensor> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        let target = if self.step < ANSWER_WORDS.len() {
            257 + self.step as u32
        } else {
            EOS
        };
        self.step += 1;

        let mut logits = vec![0f32; VOCAB];
        logits[target as usize] = 10.0;
        Ok(Tensor::from_vec(logits, (1, 1, VOCAB), &Device::Cpu)?)
    }

    fn reset_cache(&mut self) {
        self.step = 0;
    }

    fn fork(&self) -> Box<dyn LanguageModel> {
        Box::new(ScriptedModel {
            step: 0,
            forward_calls: Arc::clone(&self.forward_calls),
        })
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

pub fn scripted_handle() -> ModelHandle {
    ModelHandle::new(
        Arc::new(ByteTokenizer::default()),
        Box::new(ScriptedModel::default()),
        Device::Cpu,
    )
    .with_pad_token_id(EOS)
}

/// Fails its first forward pass across all forks, then behaves like
/// [`ScriptedModel`].
pub struct FlakyModel {
    inner: ScriptedModel,
    message: String,
    tripped: Arc<AtomicBool>,
}

impl FlakyModel {
    pub fn new(message: &str) -> Self {
        Self {
            inner: ScriptedModel::default(),
            message: message.to_string(),
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl LanguageModel for FlakyModel {
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(InferenceError::Generation(self.message.clone()));
        }
        self.inner.forward(input_ids, position)
    }

    fn reset_cache(&mut self) {
        self.inner.reset_cache();
    }

    fn fork(&self) -> Box<dyn LanguageModel> {
        Box::new(FlakyModel {
            inner: ScriptedModel {
                step: 0,
                forward_calls: Arc::clone(&self.inner.forward_calls),
            },
            message: self.message.clone(),
            tripped: Arc::clone(&self.tripped),
        })
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// Counts load attempts; optionally slow, optionally failing.
#[derive(Clone, Default)]
pub struct CountingLoader {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
    pub fail_with: Option<String>,
    /// Load succeeds, but the first generation fails with this message.
    pub flaky_with: Option<String>,
}

impl CountingLoader {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn flaky(message: &str) -> Self {
        Self {
            flaky_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn load(&self, _capability: CapabilityConfig) -> Result<ModelHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if let Some(message) = &self.fail_with {
            return Err(InferenceError::ModelLoad(message.clone()));
        }
        match &self.flaky_with {
            Some(message) => Ok(ModelHandle::new(
                Arc::new(ByteTokenizer::default()),
                Box::new(FlakyModel::new(message)),
                Device::Cpu,
            )),
            None => Ok(scripted_handle()),
        }
    }
}
