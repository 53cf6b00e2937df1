use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::engine::{EngineLoader, LoadedModel};
use crate::error::WorkerError;
use crate::protocol::Dtype;

enum CacheState {
    Empty,
    Loading,
    Ready(Arc<LoadedModel>),
}

pub struct LoadOutcome {
    pub model: Arc<LoadedModel>,
    /// True only for the call that actually ran the loader; repeat calls get
    /// the cached pair.
    pub freshly_loaded: bool,
}

/// Process-scoped model cache: at most one load ever runs, and the first
/// successful load pins `model_id`/`dtype` for the lifetime of the process.
/// Later calls with different parameters are served the cached pair, their
/// arguments silently ignored (assign-once, not a reconfiguration API).
pub struct ModelCache {
    loader: Box<dyn EngineLoader>,
    state: CacheState,
    model_id: Option<String>,
    dtype: Option<Dtype>,
}

impl ModelCache {
    pub fn new(loader: Box<dyn EngineLoader>) -> Self {
        Self {
            loader,
            state: CacheState::Empty,
            model_id: None,
            dtype: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, CacheState::Ready(_))
    }

    pub fn ready(&self) -> Option<Arc<LoadedModel>> {
        match &self.state {
            CacheState::Ready(model) => Some(model.clone()),
            _ => None,
        }
    }

    pub fn pinned(&self) -> (Option<&str>, Option<Dtype>) {
        (self.model_id.as_deref(), self.dtype)
    }

    pub fn get_or_load(
        &mut self,
        model_id: &str,
        dtype: Dtype,
        progress: &mut dyn FnMut(Value),
    ) -> Result<LoadOutcome, WorkerError> {
        if let CacheState::Ready(model) = &self.state {
            if self.model_id.as_deref() != Some(model_id) || self.dtype != Some(dtype) {
                debug!(
                    requested = model_id,
                    pinned = self.model_id.as_deref().unwrap_or("-"),
                    "cache already holds a model; ignoring requested parameters"
                );
            }
            return Ok(LoadOutcome {
                model: model.clone(),
                freshly_loaded: false,
            });
        }

        if matches!(self.state, CacheState::Loading) {
            // Single-flight guard; the loop never re-enters the cache while a
            // load runs, so hitting this means a caller bug.
            return Err(WorkerError::Load("a load is already in flight".to_string()));
        }

        self.state = CacheState::Loading;
        match self.loader.load(model_id, dtype, progress) {
            Ok(loaded) => {
                let model = Arc::new(loaded);
                self.state = CacheState::Ready(model.clone());
                self.model_id = Some(model_id.to_string());
                self.dtype = Some(dtype);
                info!(model_id, %dtype, "model cached");
                Ok(LoadOutcome {
                    model,
                    freshly_loaded: true,
                })
            }
            Err(err) => {
                // Back to Empty so the caller can retry with a new load.
                self.state = CacheState::Empty;
                Err(WorkerError::load(err))
            }
        }
    }

    /// Drops the cached pair and the pinned parameters, as if no load ever
    /// succeeded. Used when post-load validation (warm-up) fails.
    pub fn invalidate(&mut self) {
        self.state = CacheState::Empty;
        self.model_id = None;
        self.dtype = None;
    }
}
