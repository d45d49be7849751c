use serde::{Deserialize, Serialize};

use crate::cache::CacheStatus;
use crate::config::DEFAULT_MAX_NEW_TOKENS;

/// Body of `POST /api/solve`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolveRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
}

impl SolveRequest {
    pub fn question(&self) -> &str {
        self.question.as_deref().unwrap_or_default().trim()
    }

    /// Missing or zero falls back to the default budget.
    pub fn max_new_tokens(&self) -> usize {
        match self.max_new_tokens {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveResponse {
    pub output: String,
}

/// Body of `GET /api/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusResponse {
    Loading,
    Ready,
    Error { detail: String },
}

impl From<CacheStatus> for StatusResponse {
    fn from(status: CacheStatus) -> Self {
        match status {
            CacheStatus::Loading => StatusResponse::Loading,
            CacheStatus::Ready => StatusResponse::Ready,
            CacheStatus::Error(detail) => StatusResponse::Error { detail },
        }
    }
}
