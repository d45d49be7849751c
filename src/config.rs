use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_MODEL: &str = "Qwen/Qwen2.5-Math-1.5B";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 200;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "OpenMath word-problem solver")]
pub struct Args {
    /// Base model repository on the Hugging Face hub
    #[arg(short, long, default_value = DEFAULT_BASE_MODEL)]
    pub model: String,

    #[arg(long, default_value = "main")]
    pub revision: String,

    /// Directory holding adapter_config.json and adapter_model.safetensors
    #[arg(long, default_value = ".")]
    pub adapter: PathBuf,

    #[arg(long, env)]
    pub hf_token: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 7860)]
    pub port: u16,

    #[arg(long)]
    pub cpu: bool,

    #[arg(long, default_value = "web")]
    pub web_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    pub max_new_tokens: usize,

    /// Solve a single question and exit
    #[arg(short, long)]
    pub question: Option<String>,

    /// Solve the built-in example question and exit
    #[arg(long)]
    pub script: bool,

    /// Start loading the model as soon as the server starts
    #[arg(long)]
    pub preload: bool,
}

/// Where the base model and the adapter come from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub model_id: String,
    pub revision: String,
    pub adapter_path: PathBuf,
    pub hf_token: Option<String>,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_BASE_MODEL.to_string(),
            revision: "main".to_string(),
            adapter_path: PathBuf::from("."),
            hf_token: None,
        }
    }
}

impl From<&Args> for ModelSource {
    fn from(args: &Args) -> Self {
        Self {
            model_id: args.model.clone(),
            revision: args.revision.clone(),
            adapter_path: args.adapter.clone(),
            hf_token: args.hf_token.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub web_dir: PathBuf,
    pub preload: bool,
}

impl From<&Args> for ServerConfig {
    fn from(args: &Args) -> Self {
        Self {
            host: args.host.clone(),
            port: args.port,
            web_dir: args.web_dir.clone(),
            preload: args.preload,
        }
    }
}

/// Decoding policy. Greedy only: the adapter was tuned for reproducible
/// step-by-step answers, so there is no temperature or sampling knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            repetition_penalty: 1.1,
            no_repeat_ngram_size: 3,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_new_tokens(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Self::default()
        }
    }
}
