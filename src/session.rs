use std::sync::Arc;
use std::time::Instant;

use anyhow::Error as E;
use tracing::{debug, info};

use crate::engine::{ChatTokenizer, LoadedModel, StopPredicate, StreamDecoder, TokenDecoder};
use crate::error::WorkerError;
use crate::protocol::ChatMessage;
use crate::reporter::{Event, EventSink};
use crate::signal::StoppingSignal;

pub enum StepOutcome {
    Running,
    Finished,
}

/// One generation request, advanced a single decode step at a time so the
/// event loop stays responsive between tokens.
///
/// Emits `Start` once the decoder exists, an `Update` per non-empty text
/// chunk, and `Complete` with the full decoded sequences (special tokens
/// preserved) when the run ends for any reason.
pub struct GenerationSession {
    tokenizer: Arc<dyn ChatTokenizer>,
    decoder: Box<dyn TokenDecoder>,
    stream: StreamDecoder,
    signal: StoppingSignal,
    prompt: Vec<u32>,
    generated: Vec<u32>,
    max_new_tokens: usize,
    step: usize,
    chunks: usize,
    started_at: Option<Instant>,
}

impl GenerationSession {
    pub fn start(
        model: &LoadedModel,
        messages: &[ChatMessage],
        signal: StoppingSignal,
        max_new_tokens: usize,
        events: &mut dyn EventSink,
    ) -> Result<Self, WorkerError> {
        let prompt = model
            .tokenizer
            .apply_chat_template(messages, true)
            .map_err(WorkerError::generation)?;
        let decoder = model
            .engine
            .start_decode(&prompt)
            .map_err(WorkerError::generation)?;

        info!(prompt_tokens = prompt.len(), max_new_tokens, "generation started");
        events.emit(Event::Start);

        Ok(Self {
            tokenizer: model.tokenizer.clone(),
            decoder,
            stream: StreamDecoder::new(),
            signal,
            prompt,
            generated: Vec::new(),
            max_new_tokens,
            step: 0,
            chunks: 0,
            started_at: None,
        })
    }

    /// Advances the decode by one token. Interruption is checked before the
    /// model runs, so an interrupt arriving between steps never costs another
    /// forward pass.
    pub fn step(&mut self, events: &mut dyn EventSink) -> Result<StepOutcome, WorkerError> {
        if self
            .signal
            .should_stop(self.step, 1)
            .iter()
            .all(|halt| *halt)
        {
            debug!(tokens = self.generated.len(), "generation interrupted");
            self.finish(events)?;
            return Ok(StepOutcome::Finished);
        }

        let token = self.decoder.next_token().map_err(WorkerError::generation)?;
        self.step += 1;
        self.generated.push(token);

        if let Some(chunk) = self
            .stream
            .push(self.tokenizer.as_ref(), token)
            .map_err(WorkerError::generation)?
        {
            self.emit_update(chunk, events)?;
        }

        if self.tokenizer.is_stop_token(token) || self.step >= self.max_new_tokens {
            self.finish(events)?;
            return Ok(StepOutcome::Finished);
        }

        Ok(StepOutcome::Running)
    }

    fn emit_update(
        &mut self,
        chunk: String,
        events: &mut dyn EventSink,
    ) -> Result<(), WorkerError> {
        self.chunks += 1;
        let tps = if self.chunks == 1 {
            self.started_at = Some(Instant::now());
            None
        } else {
            let elapsed = self
                .started_at
                .ok_or_else(|| WorkerError::generation(E::msg("timer never started")))?
                .elapsed()
                .as_secs_f64();
            Some(self.chunks as f64 / elapsed.max(1e-6))
        };
        events.emit(Event::Update {
            output: chunk,
            tps,
            num_tokens: self.chunks,
        });
        Ok(())
    }

    fn finish(&mut self, events: &mut dyn EventSink) -> Result<(), WorkerError> {
        // Release any text the stream decoder held back waiting for a clean
        // boundary.
        if let Some(chunk) = self
            .stream
            .flush(self.tokenizer.as_ref())
            .map_err(WorkerError::generation)?
        {
            self.emit_update(chunk, events)?;
        }

        let mut full = self.prompt.clone();
        full.extend_from_slice(&self.generated);
        let output = self
            .tokenizer
            .batch_decode(&[full], false)
            .map_err(WorkerError::generation)?;
        info!(tokens = self.generated.len(), "generation complete");
        events.emit(Event::Complete { output });
        Ok(())
    }
}
