//! Scripted stand-ins for the engine seam so the control core can be tested
//! without model files: tokens are unicode scalar values, generation replays
//! a fixed script.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::{json, Value};

use crate::engine::{
    ChatTokenizer, EngineLoader, LoadedModel, ModelEngine, TokenDecoder,
};
use crate::protocol::{ChatMessage, Dtype};
use crate::reporter::Event;

/// Reserved token the scripted tokenizer treats as end-of-sequence.
pub const STOP_TOKEN: u32 = 0;

pub fn script_from(text: &str, append_stop: bool) -> Vec<u32> {
    let mut script: Vec<u32> = text.chars().map(|c| c as u32).collect();
    if append_stop {
        script.push(STOP_TOKEN);
    }
    script
}

pub fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: content.to_string(),
    }
}

pub fn statuses(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            Event::Loading(_) => "loading",
            Event::Progress(_) => "progress",
            Event::Ready => "ready",
            Event::Start => "start",
            Event::Update { .. } => "update",
            Event::Complete { .. } => "complete",
            Event::Error(_) => "error",
        })
        .collect()
}

/// Tokenizes characters one-to-one. The chat template is the flattened turn
/// contents, which keeps prompts inspectable in assertions.
pub struct ScriptedTokenizer;

impl ChatTokenizer for ScriptedTokenizer {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        _add_generation_prompt: bool,
    ) -> Result<Vec<u32>> {
        let flattened: String = messages.iter().map(|m| m.content.as_str()).collect();
        self.encode(&flattened)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.chars().map(|c| c as u32).collect())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        Ok(tokens
            .iter()
            .map(|&token| {
                if token == STOP_TOKEN {
                    if skip_special_tokens {
                        String::new()
                    } else {
                        "</s>".to_string()
                    }
                } else {
                    char::from_u32(token).map(String::from).unwrap_or_default()
                }
            })
            .collect())
    }

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> Result<Vec<String>> {
        sequences
            .iter()
            .map(|seq| self.decode(seq, skip_special_tokens))
            .collect()
    }

    fn is_stop_token(&self, token: u32) -> bool {
        token == STOP_TOKEN
    }
}

struct ScriptedDecoder {
    script: Vec<u32>,
    pos: usize,
}

impl TokenDecoder for ScriptedDecoder {
    fn next_token(&mut self) -> Result<u32> {
        let token = self.script.get(self.pos).copied().unwrap_or(STOP_TOKEN);
        self.pos += 1;
        Ok(token)
    }
}

struct ScriptedEngine {
    script: Vec<u32>,
    sessions: Rc<RefCell<usize>>,
    fail_decode: Rc<Cell<bool>>,
}

impl ModelEngine for ScriptedEngine {
    fn start_decode(&self, _prompt: &[u32]) -> Result<Box<dyn TokenDecoder>> {
        if self.fail_decode.get() {
            bail!("scripted decode failure");
        }
        *self.sessions.borrow_mut() += 1;
        Ok(Box::new(ScriptedDecoder {
            script: self.script.clone(),
            pos: 0,
        }))
    }
}

/// A model that replays `script`, plus the decode-session counter so tests
/// can assert how many sessions were opened.
pub fn loaded_model_with_script(script: Vec<u32>) -> (LoadedModel, Rc<RefCell<usize>>) {
    let sessions = Rc::new(RefCell::new(0));
    let model = scripted_model(script, sessions.clone(), Rc::new(Cell::new(false)));
    (model, sessions)
}

fn scripted_model(
    script: Vec<u32>,
    sessions: Rc<RefCell<usize>>,
    fail_decode: Rc<Cell<bool>>,
) -> LoadedModel {
    LoadedModel {
        tokenizer: Arc::new(ScriptedTokenizer),
        engine: Arc::new(ScriptedEngine {
            script,
            sessions,
            fail_decode,
        }),
    }
}

/// Loader double: records every call, can fail the next N loads, and hands
/// out scripted models wired to shared counters.
pub struct StubLoader {
    script: Vec<u32>,
    pub calls: Rc<RefCell<Vec<(String, Dtype)>>>,
    pub fail_loads: Cell<u32>,
    pub sessions: Rc<RefCell<usize>>,
    pub fail_decode: Rc<Cell<bool>>,
}

impl StubLoader {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            calls: Rc::new(RefCell::new(Vec::new())),
            fail_loads: Cell::new(0),
            sessions: Rc::new(RefCell::new(0)),
            fail_decode: Rc::new(Cell::new(false)),
        }
    }
}

impl EngineLoader for StubLoader {
    fn load(
        &mut self,
        model_id: &str,
        dtype: Dtype,
        progress: &mut dyn FnMut(Value),
    ) -> Result<LoadedModel> {
        self.calls.borrow_mut().push((model_id.to_string(), dtype));

        let pending_failures = self.fail_loads.get();
        if pending_failures > 0 {
            self.fail_loads.set(pending_failures - 1);
            bail!("stub loader failure");
        }

        progress(json!({ "status": "progress", "file": "stub.gguf", "progress": 50.0 }));
        Ok(scripted_model(
            self.script.clone(),
            self.sessions.clone(),
            self.fail_decode.clone(),
        ))
    }
}
