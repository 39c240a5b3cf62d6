//! Dialog Telemetry
//!
//! Structured events about dialog processing, fanned out to any number of
//! sinks. Sinks are fire-and-forget: they cannot return errors and must
//! never affect engine correctness. The default sink writes to `tracing`.

use std::sync::Arc;
use tracing::{error, info};

use crate::channel::{ConversationRef, Response};
use crate::event::Event;

/// A sink receiving structured dialog events. All methods default to no-ops
/// so sinks implement only what they care about.
pub trait DialogLogger: Send + Sync {
    fn on_message_start(&self, _conversation: &ConversationRef, _event: &Event, _state: &str) {}
    fn on_message_end(&self, _conversation: &ConversationRef, _state: &str) {}
    fn on_state_change(&self, _conversation: &ConversationRef, _state: &str) {}
    fn on_bot_response(&self, _conversation: &ConversationRef, _response: &Response, _state: &str) {}
    fn on_error(&self, _conversation: &ConversationRef, _state: &str, _error: &str) {}
}

/// Sink that mirrors dialog events into the tracing log.
pub struct TracingLogger;

impl DialogLogger for TracingLogger {
    fn on_message_start(&self, conversation: &ConversationRef, event: &Event, state: &str) {
        info!(
            conversation = conversation.conversation_id,
            state,
            kind = ?event.kind,
            ">>> Received message"
        );
    }

    fn on_message_end(&self, conversation: &ConversationRef, state: &str) {
        info!(conversation = conversation.conversation_id, state, "<<< Message processed");
    }

    fn on_state_change(&self, conversation: &ConversationRef, state: &str) {
        info!(conversation = conversation.conversation_id, state, "State changed");
    }

    fn on_bot_response(&self, conversation: &ConversationRef, response: &Response, state: &str) {
        info!(
            conversation = conversation.conversation_id,
            state,
            text = response.get_text().unwrap_or(""),
            ">>> Sending bot message"
        );
    }

    fn on_error(&self, conversation: &ConversationRef, state: &str, error: &str) {
        error!(conversation = conversation.conversation_id, state, error, "Dialog error");
    }
}

/// Fan-out over all registered sinks.
#[derive(Clone, Default)]
pub struct TelemetryService {
    sinks: Vec<Arc<dyn DialogLogger>>,
}

impl TelemetryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn DialogLogger>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn message_start(&self, conversation: &ConversationRef, event: &Event, state: &str) {
        for sink in &self.sinks {
            sink.on_message_start(conversation, event, state);
        }
    }

    pub fn message_end(&self, conversation: &ConversationRef, state: &str) {
        for sink in &self.sinks {
            sink.on_message_end(conversation, state);
        }
    }

    pub fn state_change(&self, conversation: &ConversationRef, state: &str) {
        for sink in &self.sinks {
            sink.on_state_change(conversation, state);
        }
    }

    pub fn bot_response(&self, conversation: &ConversationRef, response: &Response, state: &str) {
        for sink in &self.sinks {
            sink.on_bot_response(conversation, response, state);
        }
    }

    pub fn error(&self, conversation: &ConversationRef, state: &str, error: &str) {
        for sink in &self.sinks {
            sink.on_error(conversation, state, error);
        }
    }
}
