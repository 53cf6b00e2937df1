use thiserror::Error;

/// Failures the worker reports back to the caller as `error` events.
///
/// Everything here is caught at a component boundary and converted into an
/// outbound event; none of these may escape and terminate the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("model is not loaded; send a load command first")]
    NotReady,

    #[error("a generation is already in progress")]
    Busy,

    #[error("generation failed: {0}")]
    Generation(String),
}

impl WorkerError {
    pub fn load(err: anyhow::Error) -> Self {
        Self::Load(format!("{err:#}"))
    }

    pub fn generation(err: anyhow::Error) -> Self {
        Self::Generation(format!("{err:#}"))
    }
}
