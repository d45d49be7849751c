//! Serves a Qwen2.5-Math base model with a LoRA adapter for step-by-step
//! math word-problem solving, from a one-shot script or an HTTP service.

pub mod api;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod generation;
pub mod model;
pub mod sampling;
pub mod solver;
pub mod tokenizer;

pub use cache::{CacheStatus, LoadState, ModelCache};
pub use error::{InferenceError, Result};
pub use model::{LanguageModel, ModelHandle, ModelLoader};
pub use tokenizer::PromptTokenizer;
