use std::cell::Cell;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use tracing::debug;

use crate::catalog::PromptFamily;
use crate::config::SamplingConfig;

use super::{ModelEngine, TokenDecoder};

/// Quantized GGUF weights behind a family-selected candle backend.
pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn from_gguf<R: Read + Seek>(
        content: gguf_file::Content,
        reader: &mut R,
        family: PromptFamily,
        device: &Device,
    ) -> Result<Self> {
        match family {
            PromptFamily::Llama => {
                let model = quantized_llama::ModelWeights::from_gguf(content, reader, device)?;
                Ok(Self::Llama(model))
            }
            PromptFamily::Qwen => {
                let model = quantized_qwen2::ModelWeights::from_gguf(content, reader, device)?;
                Ok(Self::Qwen2(model))
            }
            PromptFamily::Mistral => Err(E::msg(
                "Mistral backend is not implemented in the runtime backend",
            )),
            PromptFamily::Unknown => Err(E::msg(
                "unknown model family: cannot choose a runtime backend",
            )),
        }
    }

    pub fn load_from_path(path: &Path, family: PromptFamily, device: &Device) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| E::msg(format!("failed to open model file '{}': {}", path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file)?;
        Self::from_gguf(content, &mut file, family, device)
    }

    pub fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input, position)?),
            Self::Qwen2(model) => Ok(model.forward(input, position)?),
        }
    }

    /// Cheap per-session copy where the backend supports it; callers fall
    /// back to reloading from disk otherwise.
    pub fn duplicate(&self) -> Option<Self> {
        match self {
            Self::Llama(model) => Some(Self::Llama(model.clone())),
            Self::Qwen2(_) => None,
        }
    }
}

/// Hands out per-session decoders over the cached weights.
pub struct CandleEngine {
    master: RuntimeModel,
    model_path: PathBuf,
    family: PromptFamily,
    device: Device,
    sampling: SamplingConfig,
    sessions: Cell<u64>,
}

impl CandleEngine {
    pub fn new(
        master: RuntimeModel,
        model_path: PathBuf,
        family: PromptFamily,
        device: Device,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            master,
            model_path,
            family,
            device,
            sampling,
            sessions: Cell::new(0),
        }
    }
}

impl ModelEngine for CandleEngine {
    fn start_decode(&self, prompt: &[u32]) -> Result<Box<dyn TokenDecoder>> {
        ensure!(!prompt.is_empty(), "cannot start decoding an empty prompt");

        let model = match self.master.duplicate() {
            Some(model) => model,
            None => {
                debug!(
                    family = ?self.family,
                    "runtime backend is not cloneable; reloading weights for this session"
                );
                RuntimeModel::load_from_path(&self.model_path, self.family, &self.device)?
            }
        };

        let session = self.sessions.get();
        self.sessions.set(session + 1);

        // Vary the sampling seed per session so repeated prompts differ.
        let logits_processor = LogitsProcessor::new(
            self.sampling.seed.wrapping_add(session),
            Some(self.sampling.temperature),
            Some(self.sampling.top_p),
        );

        Ok(Box::new(CandleDecoder {
            model,
            device: self.device.clone(),
            logits_processor,
            tokens: prompt.to_vec(),
            index_pos: 0,
        }))
    }
}

/// One decode stream: owns a KV cache inside its model copy and tracks the
/// attention position across steps.
struct CandleDecoder {
    model: RuntimeModel,
    device: Device,
    logits_processor: LogitsProcessor,
    tokens: Vec<u32>,
    index_pos: usize,
}

impl TokenDecoder for CandleDecoder {
    fn next_token(&mut self) -> Result<u32> {
        // First call feeds the whole prompt; later calls feed only the token
        // sampled last step.
        let context_size = if self.index_pos == 0 { self.tokens.len() } else { 1 };
        let start_pos = self.tokens.len().saturating_sub(context_size);
        let input_len = self.tokens.len() - start_pos;

        let input = Tensor::new(&self.tokens[start_pos..], &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, self.index_pos)?;
        let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;

        let next_token = self.logits_processor.sample(&logits)?;
        self.index_pos += input_len;
        self.tokens.push(next_token);

        Ok(next_token)
    }
}
