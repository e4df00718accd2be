//! Bus message types: inbound from a channel to the agent loop, outbound from the agent loop to a channel.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Backend-specific key/value data attached to a message (group id, priority, title...).
pub type Metadata = Map<String, Value>;

/// A message received by a channel, normalized for the agent loop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Name of the channel that received it; replies are routed back here.
    pub channel: String,
    pub sender_id: String,
    /// Routing key for replies (phone number, group id, topic, conversation id).
    pub chat_id: String,
    pub content: String,
    /// Attachment references (file paths or backend ids), in order.
    pub media: Vec<String>,
    pub metadata: Metadata,
    pub received_at: DateTime<Utc>,
}

/// A reply produced by the agent loop, consumed once by the named channel's `send`.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub metadata: Metadata,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Reply to an inbound message on the same channel and chat.
    pub fn reply_to(msg: &InboundMessage, content: impl Into<String>) -> Self {
        let mut out = Self::new(msg.channel.clone(), msg.chat_id.clone(), content);
        if let Some(is_group) = msg.metadata.get("is_group") {
            out.metadata.insert("is_group".to_string(), is_group.clone());
        }
        out
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn metadata_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
