//! Channel Adapters
//!
//! Universal interface between the engine and chat platforms. One adapter
//! per platform; the engine never assumes a concrete implementation. Only
//! the in-memory reference adapter ships with the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::entity::EntityObservation;
use crate::event::Event;

/// Error types for channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Channel not ready")]
    NotReady,
}

/// An outbound message element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Text { text: String },
    Image { url: String, caption: Option<String> },
    QuickReplies { text: String, replies: Vec<String> },
}

impl Response {
    pub fn text(text: &str) -> Self {
        Response::Text {
            text: text.to_string(),
        }
    }

    pub fn image(url: &str) -> Self {
        Response::Image {
            url: url.to_string(),
            caption: None,
        }
    }

    pub fn quick_replies(text: &str, replies: &[&str]) -> Self {
        Response::QuickReplies {
            text: text.to_string(),
            replies: replies.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Visible text of this element, if any
    pub fn get_text(&self) -> Option<&str> {
        match self {
            Response::Text { text } => Some(text),
            Response::QuickReplies { text, .. } => Some(text),
            Response::Image { caption, .. } => caption.as_deref(),
        }
    }
}

/// Reference to one conversation on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationRef {
    pub conversation_id: i64,
    pub channel: String,
}

impl ConversationRef {
    pub fn new(conversation_id: i64, channel: &str) -> Self {
        Self {
            conversation_id,
            channel: channel.to_string(),
        }
    }
}

/// Adapter between the engine and one chat platform.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name (telegram, webchat, ...)
    fn name(&self) -> &str;

    /// Parse a raw platform payload into an engine event.
    fn parse_inbound(&self, raw: &serde_json::Value) -> Result<Event, ChannelError>;

    /// Deliver responses to one conversation.
    async fn send_responses(
        &self,
        conversation: &ConversationRef,
        responses: &[Response],
    ) -> Result<(), ChannelError>;

    /// Deliver the same responses to many conversations.
    async fn broadcast(
        &self,
        conversations: &[ConversationRef],
        responses: &[Response],
    ) -> Result<(), ChannelError> {
        for conversation in conversations {
            self.send_responses(conversation, responses).await?;
        }
        Ok(())
    }
}

/// In-memory adapter used by tests and the console demo. Records everything
/// it is asked to send.
#[derive(Default)]
pub struct MemoryChannel {
    sent: Arc<Mutex<Vec<(ConversationRef, Response)>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub async fn sent(&self) -> Vec<(ConversationRef, Response)> {
        self.sent.lock().await.clone()
    }

    /// Texts sent to one conversation, in order.
    pub async fn sent_texts(&self, conversation_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(c, _)| c.conversation_id == conversation_id)
            .filter_map(|(_, r)| r.get_text().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn parse_inbound(&self, raw: &serde_json::Value) -> Result<Event, ChannelError> {
        let text = raw
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ChannelError::ParseFailed("missing 'text' field".into()))?;
        let mut event = Event::message(text);
        if let Some(entities) = raw.get("entities").and_then(|e| e.as_object()) {
            for (name, values) in entities {
                let observations: Vec<EntityObservation> =
                    serde_json::from_value(values.clone())
                        .map_err(|e| ChannelError::ParseFailed(e.to_string()))?;
                for obs in observations {
                    event = event.with_entity(name, obs);
                }
            }
        }
        Ok(event)
    }

    async fn send_responses(
        &self,
        conversation: &ConversationRef,
        responses: &[Response],
    ) -> Result<(), ChannelError> {
        let mut sent = self.sent.lock().await;
        for response in responses {
            sent.push((conversation.clone(), response.clone()));
        }
        Ok(())
    }
}

/// Registry of active channel adapters, keyed by channel name.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(name).cloned()
    }
}
