//! Inbound Events
//!
//! One in-process representation for everything that enters the resolver:
//! real user messages, postbacks, and synthetic schedule events injected by
//! the scheduler. Channel adapters produce these from raw platform payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entity::EntityObservation;

/// Reserved entity carrying the raw message text
pub const MESSAGE_TEXT_ENTITY: &str = "_message_text";

/// Reserved entity naming an explicit target state
pub const STATE_ENTITY: &str = "_state";

/// Entity carrying a recognized intent
pub const INTENT_ENTITY: &str = "intent";

/// Reserved entity marking a message no state could handle
pub const UNSUPPORTED_ENTITY: &str = "_unsupported";

/// Kind of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A regular user message
    Message,
    /// A button press / structured callback
    Postback,
    /// A synthetic event injected by the scheduler
    Schedule,
    /// Anything else (read receipts, typing, ...); ignored by the resolver
    Other,
}

/// An inbound event, already parsed into entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub entities: HashMap<String, Vec<EntityObservation>>,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            entities: HashMap::new(),
            text: None,
            timestamp: Utc::now(),
        }
    }

    /// A plain text message. The text is also carried as the reserved
    /// `_message_text` entity so states can declare support for it.
    pub fn message(text: &str) -> Self {
        let mut event = Self::new(EventKind::Message);
        event.text = Some(text.to_string());
        event
            .entities
            .insert(MESSAGE_TEXT_ENTITY.to_string(), vec![EntityObservation::text(text)]);
        event
    }

    /// A synthetic scheduler event carrying a structured payload.
    pub fn schedule(payload: HashMap<String, Vec<EntityObservation>>) -> Self {
        let mut event = Self::new(EventKind::Schedule);
        event.entities = payload;
        event
    }

    pub fn with_entity(mut self, name: &str, observation: EntityObservation) -> Self {
        self.entities
            .entry(name.to_string())
            .or_default()
            .push(observation);
        self
    }

    /// Entity names carried by this event.
    pub fn entity_names(&self) -> impl Iterator<Item = &String> {
        self.entities.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_carries_text_entity() {
        let event = Event::message("hello there");
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.text.as_deref(), Some("hello there"));
        assert!(event.entities.contains_key(MESSAGE_TEXT_ENTITY));
    }

    #[test]
    fn test_with_entity() {
        let event = Event::message("book a flight")
            .with_entity("intent", EntityObservation::text("book_flight"));
        assert!(event.entity_names().any(|n| n == "intent"));
    }
}
