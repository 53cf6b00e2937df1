use tracing::{debug, info, warn};

use crate::cache::ModelCache;
use crate::engine::{self, EngineLoader};
use crate::error::WorkerError;
use crate::protocol::{parse_command, ChatMessage, Command, Dtype};
use crate::reporter::{Event, EventSink};
use crate::session::{GenerationSession, StepOutcome};
use crate::signal::StoppingSignal;

/// The command-driven worker core. Owns the model cache, the shared stopping
/// signal and at most one in-flight generation session.
///
/// Commands are handled inline; a running generation advances one token per
/// `tick`, so `interrupt` stays deliverable at every step boundary.
pub struct Worker {
    cache: ModelCache,
    signal: StoppingSignal,
    session: Option<GenerationSession>,
    max_new_tokens: usize,
}

impl Worker {
    pub fn new(loader: Box<dyn EngineLoader>, max_new_tokens: usize) -> Self {
        Self {
            cache: ModelCache::new(loader),
            signal: StoppingSignal::default(),
            session: None,
            max_new_tokens,
        }
    }

    pub fn has_active_session(&self) -> bool {
        self.session.is_some()
    }

    /// One inbound line from the transport. Malformed commands are logged
    /// and dropped; they never abort the worker.
    pub fn handle_line(&mut self, line: &str, events: &mut dyn EventSink) {
        match parse_command(line) {
            Ok(command) => self.handle_command(command, events),
            Err(err) => warn!(%err, line, "ignoring malformed command"),
        }
    }

    fn handle_command(&mut self, command: Command, events: &mut dyn EventSink) {
        match command {
            Command::Load { model_id, dtype } => self.handle_load(&model_id, dtype, events),
            Command::Generate(messages) => self.handle_generate(&messages, events),
            Command::Interrupt => {
                debug!("interrupt requested");
                self.signal.interrupt();
            }
            Command::Reset => {
                debug!("signal reset requested");
                self.signal.reset();
            }
        }
    }

    fn handle_load(&mut self, model_id: &str, dtype: Dtype, events: &mut dyn EventSink) {
        events.emit(Event::Loading("Loading model...".to_string()));

        let outcome = self.cache.get_or_load(model_id, dtype, &mut |payload| {
            events.emit(Event::Progress(payload))
        });

        match outcome {
            Ok(outcome) => {
                if outcome.freshly_loaded {
                    events.emit(Event::Loading(
                        "Compiling shaders and warming up model...".to_string(),
                    ));
                    if let Err(err) = engine::warm_up(&outcome.model) {
                        warn!(%err, "warm-up failed, dropping the cached model");
                        self.cache.invalidate();
                        events.emit(Event::Error(WorkerError::load(err).to_string()));
                        return;
                    }
                }
                events.emit(Event::Ready);
            }
            Err(err) => events.emit(Event::Error(err.to_string())),
        }
    }

    fn handle_generate(&mut self, messages: &[ChatMessage], events: &mut dyn EventSink) {
        if self.session.is_some() {
            events.emit(Event::Error(WorkerError::Busy.to_string()));
            return;
        }

        let Some(model) = self.cache.ready() else {
            events.emit(Event::Error(WorkerError::NotReady.to_string()));
            return;
        };

        // A stale interrupt from a previous run must not kill this one.
        self.signal.reset();

        match GenerationSession::start(
            &model,
            messages,
            self.signal.clone(),
            self.max_new_tokens,
            events,
        ) {
            Ok(session) => self.session = Some(session),
            Err(err) => events.emit(Event::Error(err.to_string())),
        }
    }

    /// Advances the active generation by one token. Returns whether a session
    /// is still running afterwards.
    pub fn tick(&mut self, events: &mut dyn EventSink) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        match session.step(events) {
            Ok(StepOutcome::Running) => true,
            Ok(StepOutcome::Finished) => {
                self.session = None;
                self.signal.reset();
                false
            }
            Err(err) => {
                info!(%err, "generation aborted");
                events.emit(Event::Error(err.to_string()));
                self.session = None;
                self.signal.reset();
                false
            }
        }
    }
}
