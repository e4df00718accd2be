//! Channel contract and registry: register, start/stop and route outbound messages by name.

use crate::bus::{MessageBus, Publisher};
use crate::channels::lifecycle::ConnectionState;
use crate::channels::OutboundMessage;
use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle and send interface every adapter implements.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "signal"); also the `channel` field of outbound messages.
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Connection state; adapters without a persistent connection are `Connected` while running.
    fn state(&self) -> ConnectionState {
        if self.is_running() {
            ConnectionState::Connected
        } else {
            ConnectionState::Stopped
        }
    }

    /// Validate configuration and spawn the connection loop. A no-op when already running.
    /// A `ChannelError::Config` leaves the channel stopped.
    fn start(self: Arc<Self>, publisher: Publisher) -> Result<(), ChannelError>;

    /// Stop the loop, fail pending work and release the connection. Safe to call repeatedly
    /// or on a channel that never started.
    async fn stop(&self);

    /// Deliver a message to the backend. Errors are logged, never returned.
    async fn send(&self, msg: OutboundMessage);
}

/// Registry of channel names to channels. Shared across the runtime.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Channel>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a channel under its name. A previously registered channel with the same name is stopped.
    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let old = {
            let mut g = self.inner.write().await;
            g.insert(channel.name().to_string(), channel)
        };
        if let Some(old) = old {
            old.stop().await;
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        let g = self.inner.read().await;
        g.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut names: Vec<String> = g.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every registered channel with its own publisher. Configuration failures are
    /// logged and only affect that channel. Returns the names that started.
    pub async fn start_all(&self, bus: &MessageBus) -> Vec<String> {
        let channels: Vec<Arc<dyn Channel>> = self.inner.read().await.values().cloned().collect();
        let mut started = Vec::new();
        for channel in channels {
            let name = channel.name().to_string();
            match channel.start(bus.publisher(name.clone())) {
                Ok(()) => {
                    log::info!("{} channel started", name);
                    started.push(name);
                }
                Err(e) => log::error!("{} channel not started: {}", name, e),
            }
        }
        started.sort();
        started
    }

    pub async fn stop_all(&self) {
        let channels: Vec<Arc<dyn Channel>> = self.inner.read().await.values().cloned().collect();
        for channel in channels {
            channel.stop().await;
        }
    }

    /// Route an outbound message to the channel it names.
    pub async fn dispatch(&self, msg: OutboundMessage) {
        match self.get(&msg.channel).await {
            Some(channel) => channel.send(msg).await,
            None => log::warn!("outbound: unknown channel {}", msg.channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Lifecycle;
    use std::sync::Mutex;

    struct FakeChannel {
        name: String,
        configured: bool,
        lifecycle: Lifecycle,
        sent: Mutex<Vec<String>>,
        stops: Mutex<u32>,
    }

    impl FakeChannel {
        fn new(name: &str, configured: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                configured,
                lifecycle: Lifecycle::new(name),
                sent: Mutex::new(Vec::new()),
                stops: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_running(&self) -> bool {
            self.lifecycle.is_running()
        }

        fn start(self: Arc<Self>, _publisher: Publisher) -> Result<(), ChannelError> {
            if !self.configured {
                return Err(ChannelError::config("token not configured"));
            }
            self.lifecycle.begin();
            Ok(())
        }

        async fn stop(&self) {
            self.lifecycle.stop();
            *self.stops.lock().unwrap() += 1;
        }

        async fn send(&self, msg: OutboundMessage) {
            self.sent.lock().unwrap().push(msg.content);
        }
    }

    #[tokio::test]
    async fn misconfigured_channel_does_not_affect_siblings() {
        let registry = ChannelRegistry::new();
        let good = FakeChannel::new("good", true);
        let bad = FakeChannel::new("bad", false);
        registry.register(good.clone()).await;
        registry.register(bad.clone()).await;
        let (bus, _rx) = MessageBus::new(4);

        let started = registry.start_all(&bus).await;
        assert_eq!(started, vec!["good".to_string()]);
        assert!(good.is_running());
        assert!(!bad.is_running());
    }

    #[tokio::test]
    async fn dispatch_routes_by_channel_name() {
        let registry = ChannelRegistry::new();
        let a = FakeChannel::new("a", true);
        let b = FakeChannel::new("b", true);
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        registry.dispatch(OutboundMessage::new("b", "chat", "hello")).await;
        registry.dispatch(OutboundMessage::new("missing", "chat", "lost")).await;

        assert!(a.sent.lock().unwrap().is_empty());
        assert_eq!(*b.sent.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn replacing_a_channel_stops_the_old_one() {
        let registry = ChannelRegistry::new();
        let first = FakeChannel::new("signal", true);
        registry.register(first.clone()).await;
        registry.register(FakeChannel::new("signal", true)).await;
        assert_eq!(*first.stops.lock().unwrap(), 1);
        assert_eq!(registry.names().await, vec!["signal".to_string()]);
    }
}
