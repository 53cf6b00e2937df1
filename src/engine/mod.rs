pub mod backend;
pub mod loader;
pub mod tokenizer;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::protocol::{ChatMessage, Dtype};

/// Tokenizer capability consumed by the control core. Implementations wrap a
/// real tokenizer; the core never sees token tables or merges.
pub trait ChatTokenizer {
    /// Renders the conversation through the model's chat template and
    /// tokenizes it, with the generation prompt appended when requested.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<u32>>;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Decodes whole sequences; used for the final `complete` payload where
    /// special tokens are preserved.
    fn batch_decode(&self, sequences: &[Vec<u32>], skip_special_tokens: bool)
        -> Result<Vec<String>>;

    fn is_stop_token(&self, token: u32) -> bool;
}

/// Per-session decode state. A decoder owns its KV cache and yields one
/// sampled token per call.
pub trait TokenDecoder {
    fn next_token(&mut self) -> Result<u32>;
}

/// Model capability: hands out independent decoders over shared weights.
pub trait ModelEngine {
    fn start_decode(&self, prompt: &[u32]) -> Result<Box<dyn TokenDecoder>>;
}

/// Receives finalized text chunks as they are produced.
pub trait TokenSink {
    fn on_text(&mut self, chunk: &str);
}

/// Consulted once per decode step; returns the stop decision for every
/// sequence in the batch.
pub trait StopPredicate {
    fn should_stop(&self, step: usize, batch_size: usize) -> Vec<bool>;
}

/// The cached model/tokenizer pair. Read-only after load; shared by every
/// generation session.
pub struct LoadedModel {
    pub tokenizer: Arc<dyn ChatTokenizer>,
    pub engine: Arc<dyn ModelEngine>,
}

/// Loads a model/tokenizer pair for the cache, streaming progress payloads
/// verbatim to the given callback.
pub trait EngineLoader {
    fn load(
        &mut self,
        model_id: &str,
        dtype: Dtype,
        progress: &mut dyn FnMut(Value),
    ) -> Result<LoadedModel>;
}

/// Incremental detokenizer for streamed output. Tokens rarely map one-to-one
/// to text: a multi-byte character can span two tokens, and sentencepiece
/// decoders drop leading spaces when a token is decoded alone. The decoder
/// keeps a window of pending tokens and only emits the text delta once the
/// window decodes to something that ends on a clean boundary.
#[derive(Default)]
pub struct StreamDecoder {
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one sampled token; returns the newly finalized text, if any.
    pub fn push(&mut self, tokenizer: &dyn ChatTokenizer, token: u32) -> Result<Option<String>> {
        let prev_text = self.window_text(tokenizer, self.current_index)?;
        self.tokens.push(token);
        let text = self.window_text(tokenizer, self.tokens.len())?;
        if text.len() > prev_text.len()
            && text.chars().last().is_some_and(|c| c.is_alphanumeric())
        {
            let delta = text.get(prev_text.len()..).unwrap_or("").to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(delta))
        } else {
            Ok(None)
        }
    }

    /// Emits whatever text the pending window still holds. Called once when
    /// decoding ends so held-back punctuation is not lost.
    pub fn flush(&mut self, tokenizer: &dyn ChatTokenizer) -> Result<Option<String>> {
        let prev_text = self.window_text(tokenizer, self.current_index)?;
        let text = self.window_text(tokenizer, self.tokens.len())?;
        self.prev_index = self.tokens.len();
        self.current_index = self.tokens.len();
        match text.get(prev_text.len()..) {
            Some(delta) if !delta.is_empty() => Ok(Some(delta.to_string())),
            _ => Ok(None),
        }
    }

    fn window_text(&self, tokenizer: &dyn ChatTokenizer, end: usize) -> Result<String> {
        if self.prev_index >= end {
            return Ok(String::new());
        }
        tokenizer.decode(&self.tokens[self.prev_index..end], true)
    }
}

/// Blocking decode: runs up to `max_new_tokens` steps, streaming finalized
/// text into `sink` and consulting `stop` at every step boundary. Returns
/// the full token sequences (prompt included), one per batch sequence.
pub fn run_decode(
    engine: &dyn ModelEngine,
    tokenizer: &dyn ChatTokenizer,
    prompt: &[u32],
    max_new_tokens: usize,
    sink: &mut dyn TokenSink,
    stop: &dyn StopPredicate,
) -> Result<Vec<Vec<u32>>> {
    let mut decoder = engine.start_decode(prompt)?;
    let mut stream = StreamDecoder::new();
    let mut generated = Vec::new();

    for step in 0..max_new_tokens {
        if stop.should_stop(step, 1).iter().all(|halt| *halt) {
            break;
        }
        let token = decoder.next_token()?;
        generated.push(token);
        if let Some(chunk) = stream.push(tokenizer, token)? {
            sink.on_text(&chunk);
        }
        if tokenizer.is_stop_token(token) {
            break;
        }
    }
    if let Some(chunk) = stream.flush(tokenizer)? {
        sink.on_text(&chunk);
    }

    let mut full = prompt.to_vec();
    full.extend_from_slice(&generated);
    Ok(vec![full])
}

/// One-token throwaway generation run after the first load, before `ready`
/// is announced. Amortizes backend initialization; not streamed, not
/// cancellable.
pub fn warm_up(model: &LoadedModel) -> Result<()> {
    let prompt = model.tokenizer.encode("a")?;
    run_decode(
        model.engine.as_ref(),
        model.tokenizer.as_ref(),
        &prompt,
        1,
        &mut DiscardSink,
        &NeverStop,
    )?;
    Ok(())
}

struct DiscardSink;

impl TokenSink for DiscardSink {
    fn on_text(&mut self, _chunk: &str) {}
}

struct NeverStop;

impl StopPredicate for NeverStop {
    fn should_stop(&self, _step: usize, batch_size: usize) -> Vec<bool> {
        vec![false; batch_size]
    }
}
