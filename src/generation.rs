use std::time::Instant;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::config::GenerationConfig;
use crate::error::{InferenceError, Result};
use crate::model::LanguageModel;
use crate::sampling::select_next_token;
use crate::tokenizer::PromptTokenizer;

pub struct GenerationOutput {
    /// Prompt and completion decoded together.
    pub text: String,
    pub prompt_tokens: usize,
    pub tokens: Vec<u32>,
    pub tokens_per_second: f64,
    pub total_time_ms: u128,
}

pub struct TextGenerator<'a> {
    model: &'a mut dyn LanguageModel,
    tokenizer: &'a dyn PromptTokenizer,
    device: &'a Device,
    eos_token_id: u32,
}

impl<'a> TextGenerator<'a> {
    pub fn new(
        model: &'a mut dyn LanguageModel,
        tokenizer: &'a dyn PromptTokenizer,
        device: &'a Device,
        eos_token_id: u32,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            eos_token_id,
        }
    }

    /// Greedy decoding of at most `config.max_new_tokens` tokens.
    pub fn generate(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        let start_time = Instant::now();

        self.model.reset_cache();

        let prompt_tokens = self.tokenizer.encode(prompt)?;
        let prompt_len = prompt_tokens.len();
        info!("Prompt tokens: {}", prompt_len);

        if prompt_tokens.is_empty() {
            return Err(InferenceError::Generation("Empty prompt".to_string()));
        }

        let mut all_tokens = prompt_tokens.clone();
        let mut generated_tokens: Vec<u32> = Vec::new();

        let generation_start = Instant::now();

        if config.max_new_tokens > 0 {
            // Process prompt (prefill)
            let input_tensor = Tensor::new(prompt_tokens.as_slice(), self.device)?
                .unsqueeze(0)?;
            let mut logits = self.model.forward(&input_tensor, 0)?;

            for i in 0..config.max_new_tokens {
                let next_token = select_next_token(&logits, &all_tokens, config)?;

                if next_token == self.eos_token_id {
                    debug!("Stop token {} generated at position {}", next_token, i);
                    break;
                }

                generated_tokens.push(next_token);
                all_tokens.push(next_token);

                if i + 1 == config.max_new_tokens {
                    break;
                }

                let input = Tensor::new(&[next_token], self.device)?.unsqueeze(0)?;
                logits = self.model.forward(&input, prompt_len + i)?;
            }
        }

        let generation_time = generation_start.elapsed();
        let total_time = start_time.elapsed();

        let tokens_per_second = if generation_time.as_secs_f64() > 0.0 {
            generated_tokens.len() as f64 / generation_time.as_secs_f64()
        } else {
            0.0
        };

        let text = self.tokenizer.decode(&all_tokens)?;

        info!(
            "Generated {} tokens in {:?} ({:.2} tokens/sec)",
            generated_tokens.len(),
            generation_time,
            tokens_per_second
        );

        Ok(GenerationOutput {
            text,
            prompt_tokens: prompt_len,
            tokens: generated_tokens,
            tokens_per_second,
            total_time_ms: total_time.as_millis(),
        })
    }
}
