//! Lazily loaded, process-wide model slot.
//!
//! The first `get()` runs the probe and the loader; every later call either
//! gets the same handle or the same failure message. A failed load is never
//! retried on its own, only through [`ModelCache::reset`].

use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use tracing::{error, info, warn};

use crate::device::{probe, CapabilityConfig};
use crate::error::{InferenceError, Result};
use crate::model::{ModelHandle, ModelLoader};

#[derive(Debug, Clone)]
pub enum LoadState {
    Unloaded,
    Loaded(Arc<ModelHandle>),
    Failed(String),
}

/// Externally visible view of [`LoadState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Loading,
    Ready,
    Error(String),
}

type Probe = Box<dyn Fn() -> CapabilityConfig + Send + Sync>;

pub struct ModelCache {
    loader: Box<dyn ModelLoader>,
    probe: Probe,
    /// Read lock-free; only stored to while `init` is held.
    state: ArcSwap<LoadState>,
    /// Serializes load attempts; never held during inference.
    init: Mutex<()>,
}

impl ModelCache {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self::with_probe(loader, probe)
    }

    pub fn with_probe(
        loader: impl ModelLoader + 'static,
        probe: impl Fn() -> CapabilityConfig + Send + Sync + 'static,
    ) -> Self {
        Self {
            loader: Box::new(loader),
            probe: Box::new(probe),
            state: ArcSwap::from_pointee(LoadState::Unloaded),
            init: Mutex::new(()),
        }
    }

    /// The loaded handle, loading it first if nobody has tried yet.
    pub fn get(&self) -> Result<Arc<ModelHandle>> {
        if let LoadState::Loaded(handle) = &**self.state.load() {
            return Ok(Arc::clone(handle));
        }

        let _init = self.init.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // someone else may have settled the state while we waited
        match &**self.state.load() {
            LoadState::Loaded(handle) => return Ok(Arc::clone(handle)),
            LoadState::Failed(message) => return Err(InferenceError::CachedLoad(message.clone())),
            LoadState::Unloaded => {}
        }

        let capability = (self.probe)();
        info!(
            "Loading model (accelerator: {}, quantize: {})",
            capability.use_accelerator, capability.quantize
        );
        let started = Instant::now();

        match self.loader.load(capability) {
            Ok(handle) => {
                let handle = Arc::new(handle);
                self.state.store(Arc::new(LoadState::Loaded(Arc::clone(&handle))));
                info!("Model loaded in {:?} on {}", started.elapsed(), handle.device_name());
                Ok(handle)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Model failed to load: {}", message);
                self.state.store(Arc::new(LoadState::Failed(message.clone())));
                Err(InferenceError::CachedLoad(message))
            }
        }
    }

    /// Current state without triggering a load.
    pub fn status(&self) -> CacheStatus {
        match &**self.state.load() {
            LoadState::Unloaded => CacheStatus::Loading,
            LoadState::Loaded(_) => CacheStatus::Ready,
            LoadState::Failed(message) => CacheStatus::Error(message.clone()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&**self.state.load(), LoadState::Loaded(_))
    }

    /// Forget a failed load so the next `get()` tries again. A loaded model
    /// is kept. Returns whether anything was cleared.
    pub fn reset(&self) -> bool {
        let _init = self.init.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let LoadState::Failed(message) = &**self.state.load() {
            warn!("Clearing cached load failure: {}", message);
            self.state.store(Arc::new(LoadState::Unloaded));
            return true;
        }
        false
    }
}
