mod routes;
mod types;

pub use routes::create_router;
pub use types::{SolveRequest, SolveResponse, StatusResponse};

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::ModelCache;

/// Shared application state
pub struct AppState {
    pub cache: Arc<ModelCache>,
    pub model_id: String,
    pub web_dir: PathBuf,
}
