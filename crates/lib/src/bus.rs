//! Message bus boundary between channels and the agent loop.
//!
//! Channels hold a [`Publisher`] and push normalized inbound messages into a bounded
//! mpsc queue; the agent loop drains the receiver. Outbound replies go back through
//! [`crate::channels::ChannelRegistry::dispatch`].

use crate::channels::{InboundMessage, Metadata};
use chrono::Utc;
use tokio::sync::mpsc;

pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Owner side of the inbound queue. Hands out one [`Publisher`] per channel.
#[derive(Clone)]
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        (Self { inbound_tx }, inbound_rx)
    }

    pub fn publisher(&self, channel: impl Into<String>) -> Publisher {
        Publisher {
            channel: channel.into(),
            tx: self.inbound_tx.clone(),
        }
    }
}

/// A channel's hook into the bus.
#[derive(Clone)]
pub struct Publisher {
    channel: String,
    tx: mpsc::Sender<InboundMessage>,
}

impl Publisher {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Build an inbound message stamped with the current time and forward it.
    /// Messages with an empty sender or chat id are dropped with a warning.
    /// Returns false only when the bus has been closed.
    pub async fn publish(
        &self,
        sender_id: &str,
        chat_id: &str,
        content: &str,
        media: Vec<String>,
        metadata: Metadata,
    ) -> bool {
        if sender_id.is_empty() || chat_id.is_empty() {
            log::warn!(
                "{}: dropping inbound message without sender or chat id",
                self.channel
            );
            return true;
        }
        let msg = InboundMessage {
            channel: self.channel.clone(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media,
            metadata,
            received_at: Utc::now(),
        };
        if self.tx.send(msg).await.is_err() {
            log::debug!("{}: inbound bus closed", self.channel);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_stamps_channel_name() {
        let (bus, mut rx) = MessageBus::new(4);
        let publisher = bus.publisher("signal");
        assert!(
            publisher
                .publish("+1555", "+1555", "hi", vec![], Metadata::new())
                .await
        );
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "signal");
        assert_eq!(msg.sender_id, "+1555");
        assert_eq!(msg.content, "hi");
    }

    #[tokio::test]
    async fn publish_drops_messages_without_routing_key() {
        let (bus, mut rx) = MessageBus::new(4);
        let publisher = bus.publisher("omi");
        assert!(publisher.publish("omi-wearable", "", "x", vec![], Metadata::new()).await);
        drop(bus);
        drop(publisher);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_reports_closed_bus() {
        let (bus, rx) = MessageBus::new(4);
        let publisher = bus.publisher("ntfy");
        drop(rx);
        assert!(!publisher.publish("ntfy", "alerts", "x", vec![], Metadata::new()).await);
    }
}
