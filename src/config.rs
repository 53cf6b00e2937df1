use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

/// Sampling knobs handed to the decode backend.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            seed: 299_792_458,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub listen_addr: String,
    pub models_dir: String,
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
            models_dir: "models".to_string(),
            max_new_tokens: 512,
            sampling: SamplingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Reads a TOML config, or the defaults when no path is given. Unknown
    /// keys are rejected so typos surface at startup instead of silently
    /// falling back.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| format!("config read failed '{}': {}", path.display(), e))?;
                let config: Self = toml::from_str(&raw)
                    .map_err(|e| format!("config parse failed '{}': {}", path.display(), e))?;
                info!(path = %path.display(), "configuration loaded");
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }
}
