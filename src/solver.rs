//! Question in, worked solution out.
//!
//! The prompt layout below is the one the adapter was fine-tuned on. The
//! model does not reject a different layout, it just answers worse, so the
//! text must stay byte-for-byte identical.

use tracing::info;

use crate::config::GenerationConfig;
use crate::error::{InferenceError, Result};
use crate::generation::TextGenerator;
use crate::model::ModelHandle;

pub const INSTRUCTION: &str = "Solve the math problem step by step and give the final answer.";

pub const EXAMPLE_QUESTION: &str =
    "If a store sells pencils at 3 for $1, how much do 15 pencils cost?";

pub fn render_prompt(question: &str) -> String {
    format!(
        "### Instruction:\n{}\n\n### Problem:\n{}\n\n### Solution:\n",
        INSTRUCTION, question
    )
}

pub fn validate(question: &str, max_new_tokens: usize) -> Result<()> {
    if question.trim().is_empty() {
        return Err(InferenceError::Validation("Question is required".to_string()));
    }
    if max_new_tokens == 0 {
        return Err(InferenceError::Validation(
            "max_new_tokens must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Returns the decoded prompt followed by the generated solution.
pub fn solve(question: &str, max_new_tokens: usize, handle: &ModelHandle) -> Result<String> {
    validate(question, max_new_tokens)?;

    let prompt = render_prompt(question);
    let config = GenerationConfig::with_max_new_tokens(max_new_tokens);

    let mut session = handle.model.fork();
    let mut generator = TextGenerator::new(
        session.as_mut(),
        handle.tokenizer.as_ref(),
        &handle.device,
        handle.generation.eos_token_id,
    );
    let output = generator.generate(&prompt, &config)?;

    info!(
        "Solved in {}ms ({} prompt tokens, {} new tokens)",
        output.total_time_ms,
        output.prompt_tokens,
        output.tokens.len()
    );
    Ok(output.text)
}
