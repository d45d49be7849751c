use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("{0}")]
    Validation(String),

    #[error("Model loading error: {0}")]
    ModelLoad(String),

    /// Replayed verbatim for every caller once a load attempt has failed.
    #[error("{0}")]
    CachedLoad(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl InferenceError {
    /// True when the caller sent something unusable, as opposed to a
    /// failure on the server side.
    pub fn is_client_error(&self) -> bool {
        matches!(self, InferenceError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
