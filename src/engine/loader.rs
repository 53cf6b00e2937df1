use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::Device;
use serde_json::{json, Value};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::catalog::ModelCatalog;
use crate::config::SamplingConfig;
use crate::protocol::Dtype;

use super::backend::{CandleEngine, RuntimeModel};
use super::tokenizer::{resolve_tokenizer_path, HfTokenizer};
use super::{EngineLoader, LoadedModel};

/// Loads GGUF weights and a tokenizer from the local models directory,
/// reporting byte-level read progress while the weights stream in.
pub struct GgufLoader {
    models_dir: PathBuf,
    sampling: SamplingConfig,
    device: Device,
}

impl GgufLoader {
    pub fn new(models_dir: PathBuf, sampling: SamplingConfig) -> Self {
        Self {
            models_dir,
            sampling,
            device: Device::Cpu,
        }
    }
}

impl EngineLoader for GgufLoader {
    fn load(
        &mut self,
        model_id: &str,
        dtype: Dtype,
        progress: &mut dyn FnMut(Value),
    ) -> Result<LoadedModel> {
        let catalog = ModelCatalog::discover(&self.models_dir).map_err(E::msg)?;
        let entry = catalog.resolve(model_id).map_err(E::msg)?;
        info!(
            model_id,
            %dtype,
            family = ?entry.family,
            path = %entry.path.display(),
            "loading model"
        );

        let file_name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.id.clone());
        let total = fs::metadata(&entry.path)?.len();
        progress(json!({ "status": "initiate", "file": file_name, "total": total }));

        let file = fs::File::open(&entry.path)?;
        let mut reader = ProgressReader::new(file, file_name.clone(), total, progress);
        let content = gguf_file::Content::read(&mut reader)?;
        let master = RuntimeModel::from_gguf(content, &mut reader, entry.family, &self.device)?;
        drop(reader);
        progress(json!({ "status": "done", "file": file_name }));

        let tokenizer = match resolve_tokenizer_path(&entry.path, entry.tokenizer_path.clone()) {
            Some(path) => {
                info!(path = %path.display(), "using local tokenizer");
                Tokenizer::from_file(path).map_err(E::msg)?
            }
            None => fetch_tokenizer_from_hub(model_id)?,
        };
        let tokenizer = HfTokenizer::new(tokenizer, entry.family)?;

        let engine = CandleEngine::new(
            master,
            entry.path,
            entry.family,
            self.device.clone(),
            self.sampling,
        );

        Ok(LoadedModel {
            tokenizer: Arc::new(tokenizer),
            engine: Arc::new(engine),
        })
    }
}

fn fetch_tokenizer_from_hub(model_id: &str) -> Result<Tokenizer> {
    if !model_id.contains('/') {
        bail!(
            "no tokenizer.json found for '{}' and it is not a hub repo id",
            model_id
        );
    }

    warn!(model_id, "tokenizer.json not found locally, fetching from HF hub");
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.model(model_id.to_string());
    let path = repo.get("tokenizer.json")?;
    Tokenizer::from_file(path).map_err(E::msg)
}

/// Counts bytes as the GGUF parser pulls them and forwards progress payloads
/// in 5% increments.
struct ProgressReader<'a, R> {
    inner: R,
    file: String,
    total: u64,
    read: u64,
    last_pct: u64,
    progress: &'a mut dyn FnMut(Value),
}

impl<'a, R> ProgressReader<'a, R> {
    fn new(inner: R, file: String, total: u64, progress: &'a mut dyn FnMut(Value)) -> Self {
        Self {
            inner,
            file,
            total,
            read: 0,
            last_pct: 0,
            progress,
        }
    }

    fn report(&mut self) {
        let pct = (self.read * 100 / self.total.max(1)).min(100);
        if pct >= self.last_pct + 5 || (pct == 100 && self.last_pct < 100) {
            self.last_pct = pct;
            (self.progress)(json!({
                "status": "progress",
                "file": self.file,
                "loaded": self.read.min(self.total),
                "total": self.total,
                "progress": pct as f64,
            }));
        }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        self.report();
        Ok(n)
    }
}

impl<R: Seek> Seek for ProgressReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}
