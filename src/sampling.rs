use std::collections::HashSet;

use candle_core::{DType, Tensor};

use crate::config::GenerationConfig;
use crate::error::Result;

/// Pick the next token deterministically: repetition penalty, then the
/// n-gram ban, then argmax.
pub fn select_next_token(
    logits: &Tensor,
    context: &[u32],
    config: &GenerationConfig,
) -> Result<u32> {
    let last_logits = get_last_logits(logits)?;
    let mut scores: Vec<f32> = last_logits.to_dtype(DType::F32)?.to_vec1()?;

    apply_repeat_penalty(&mut scores, config.repetition_penalty, context);
    ban_repeated_ngrams(&mut scores, context, config.no_repeat_ngram_size);

    Ok(argmax(&scores))
}

pub fn get_last_logits(logits: &Tensor) -> Result<Tensor> {
    let dims = logits.dims();
    match dims.len() {
        1 => Ok(logits.clone()),
        2 => {
            let last_idx = dims[0] - 1;
            Ok(logits.get(last_idx)?)
        }
        3 => {
            let seq_len = dims[1];
            let logits = logits.get(0)?;
            Ok(logits.get(seq_len - 1)?)
        }
        _ => {
            let mut result = logits.clone();
            while result.dims().len() > 1 {
                if result.dims()[0] == 1 {
                    result = result.squeeze(0)?;
                } else {
                    break;
                }
            }
            Ok(result)
        }
    }
}

/// Each distinct token already in the sequence is penalized once.
pub fn apply_repeat_penalty(scores: &mut [f32], repeat_penalty: f32, context: &[u32]) {
    if repeat_penalty == 1.0 || context.is_empty() {
        return;
    }

    let seen: HashSet<u32> = context.iter().copied().collect();
    for token_id in seen {
        let idx = token_id as usize;
        if let Some(score) = scores.get_mut(idx) {
            *score = if *score < 0.0 {
                *score * repeat_penalty
            } else {
                *score / repeat_penalty
            };
        }
    }
}

/// Tokens that would complete an n-gram already present in `context`.
pub fn banned_ngram_tokens(context: &[u32], ngram_size: usize) -> HashSet<u32> {
    let mut banned = HashSet::new();
    if ngram_size == 0 || context.len() + 1 < ngram_size {
        return banned;
    }

    let prefix_len = ngram_size - 1;
    let prefix = &context[context.len() - prefix_len..];
    for window in context.windows(ngram_size) {
        if &window[..prefix_len] == prefix {
            banned.insert(window[prefix_len]);
        }
    }
    banned
}

pub fn ban_repeated_ngrams(scores: &mut [f32], context: &[u32], ngram_size: usize) {
    for token_id in banned_ngram_tokens(context, ngram_size) {
        if let Some(score) = scores.get_mut(token_id as usize) {
            *score = f32::NEG_INFINITY;
        }
    }
}

/// Highest score wins; ties go to the lowest id.
pub fn argmax(scores: &[f32]) -> u32 {
    let mut best = 0usize;
    for (idx, score) in scores.iter().enumerate() {
        if score.total_cmp(&scores[best]).is_gt() {
            best = idx;
        }
    }
    best as u32
}
