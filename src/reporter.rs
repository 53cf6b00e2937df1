use std::collections::VecDeque;

use serde_json::{json, Value};

/// Outbound status events produced by the cache and generation sessions.
///
/// `Progress` carries the loader's payload untouched; the reporter forwards
/// it verbatim so the caller can render load progress however it likes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Loading(String),
    Progress(Value),
    Ready,
    Start,
    Update {
        output: String,
        tps: Option<f64>,
        num_tokens: usize,
    },
    Complete {
        output: Vec<String>,
    },
    Error(String),
}

/// Where components emit events. The worker core never writes to a socket
/// directly; it only talks to a sink.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// Outbound event queue drained by the transport loop once per turn.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl EventSink for EventQueue {
    fn emit(&mut self, event: Event) {
        self.queue.push_back(event);
    }
}

/// Maps an event to its wire shape. Field names and optionality follow the
/// caller protocol exactly; `tps` is omitted (not null) when undefined.
pub fn to_wire(event: &Event) -> Value {
    match event {
        Event::Loading(data) => json!({ "status": "loading", "data": data }),
        Event::Progress(payload) => payload.clone(),
        Event::Ready => json!({ "status": "ready" }),
        Event::Start => json!({ "status": "start" }),
        Event::Update {
            output,
            tps,
            num_tokens,
        } => {
            let mut wire = json!({
                "status": "update",
                "output": output,
                "numTokens": num_tokens,
            });
            if let Some(tps) = tps {
                wire["tps"] = json!(tps);
            }
            wire
        }
        Event::Complete { output } => json!({ "status": "complete", "output": output }),
        Event::Error(message) => json!({ "status": "error", "message": message }),
    }
}

/// One newline-terminated JSON frame, ready for the transport buffers.
pub fn encode_frame(event: &Event) -> Vec<u8> {
    let mut frame = to_wire(event).to_string().into_bytes();
    frame.push(b'\n');
    frame
}
