//! Process wiring: build the enabled channels from config, start them, feed inbound
//! messages to a handler, route its replies back, and stop everything on Ctrl+C or SIGTERM.

use crate::bus::MessageBus;
use crate::channels::imsg::ImsgSource;
use crate::channels::omi::OmiSource;
use crate::channels::{
    Channel, ChannelRegistry, ConnectionState, InboundMessage, NtfyChannel, OutboundMessage,
    SignalChannel,
};
use crate::config::{self, Config};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound on waiting for a channel to connect before a one-shot send.
const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Consumer of inbound messages (normally the agent loop). A returned message is
/// dispatched through the registry.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, msg: &InboundMessage) -> Option<OutboundMessage>;
}

/// Logs every inbound message and never replies.
pub struct LogHandler;

#[async_trait]
impl InboundHandler for LogHandler {
    async fn handle(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        log::info!(
            "inbound: {} message from {} in {} ({} chars)",
            msg.channel,
            msg.sender_id,
            msg.chat_id,
            msg.content.chars().count()
        );
        None
    }
}

/// Replies with the inbound content; for checking a channel end to end.
pub struct EchoHandler;

#[async_trait]
impl InboundHandler for EchoHandler {
    async fn handle(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        if msg.content.is_empty() {
            return None;
        }
        Some(OutboundMessage::reply_to(msg, msg.content.clone()))
    }
}

/// Construct every channel enabled in config, with env overrides applied to secrets.
pub fn build_channels(config: &Config) -> Vec<Arc<dyn Channel>> {
    let config = config::with_env_overrides(config);
    let channels = config.channels;
    let mut out: Vec<Arc<dyn Channel>> = Vec::new();
    if channels.signal.enabled {
        out.push(Arc::new(SignalChannel::new(channels.signal)));
    }
    if channels.ntfy.enabled {
        out.push(Arc::new(NtfyChannel::new(channels.ntfy)));
    }
    if channels.imsg.enabled {
        out.push(Arc::new(ImsgSource::new(channels.imsg).into_channel()));
    }
    if channels.omi.enabled {
        out.push(Arc::new(OmiSource::new(channels.omi).into_channel()));
    }
    out
}

/// Drain the inbound queue into `handler`, dispatching replies. Ends when every publisher
/// is dropped.
pub async fn process_inbound(
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    handler: Arc<dyn InboundHandler>,
    registry: Arc<ChannelRegistry>,
) {
    while let Some(msg) = inbound_rx.recv().await {
        if let Some(reply) = handler.handle(&msg).await {
            registry.dispatch(reply).await;
        }
    }
    log::debug!("inbound queue closed");
}

/// Run the enabled channels until a shutdown signal arrives.
pub async fn run(config: Config, handler: Arc<dyn InboundHandler>) -> Result<()> {
    let registry = Arc::new(ChannelRegistry::new());
    for channel in build_channels(&config) {
        registry.register(channel).await;
    }
    let names = registry.names().await;
    if names.is_empty() {
        anyhow::bail!("no channels enabled (set channels.<name>.enabled in the config file)");
    }

    let (bus, inbound_rx) = MessageBus::new(config.bus.capacity);
    let started = registry.start_all(&bus).await;
    drop(bus);
    if started.is_empty() {
        registry.stop_all().await;
        anyhow::bail!("none of the enabled channels started: {}", names.join(", "));
    }
    log::info!("channels running: {}", started.join(", "));

    let processor: JoinHandle<()> =
        tokio::spawn(process_inbound(inbound_rx, handler, registry.clone()));

    shutdown_signal().await;
    log::info!("shutdown signal received, stopping channels");
    registry.stop_all().await;
    processor.abort();
    log::info!("channels stopped");
    Ok(())
}

/// Start one channel, wait for it to connect, deliver a single message, stop.
pub async fn send_once(config: Config, msg: OutboundMessage) -> Result<()> {
    let channel = build_channels(&config)
        .into_iter()
        .find(|c| c.name() == msg.channel)
        .with_context(|| format!("channel {} is not enabled", msg.channel))?;

    let (bus, _inbound_rx) = MessageBus::new(config.bus.capacity);
    channel
        .clone()
        .start(bus.publisher(msg.channel.clone()))
        .with_context(|| format!("starting {} channel", msg.channel))?;

    let ready = tokio::time::timeout(READY_TIMEOUT, async {
        while channel.state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if ready.is_err() {
        channel.stop().await;
        anyhow::bail!("{} channel did not connect within {:?}", msg.channel, READY_TIMEOUT);
    }

    channel.send(msg).await;
    channel.stop().await;
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Metadata;
    use chrono::Utc;
    use serde_json::json;

    fn inbound(content: &str, is_group: bool) -> InboundMessage {
        let mut metadata = Metadata::new();
        metadata.insert("is_group".into(), json!(is_group));
        InboundMessage {
            channel: "signal".into(),
            sender_id: "+1555".into(),
            chat_id: "group-1".into(),
            content: content.into(),
            media: vec![],
            metadata,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn echo_replies_on_same_chat() {
        let reply = EchoHandler.handle(&inbound("ping", true)).await.unwrap();
        assert_eq!(reply.channel, "signal");
        assert_eq!(reply.chat_id, "group-1");
        assert_eq!(reply.content, "ping");
        assert!(reply.metadata_bool("is_group"));
        assert!(EchoHandler.handle(&inbound("", false)).await.is_none());
        assert!(LogHandler.handle(&inbound("ping", false)).await.is_none());
    }

    #[test]
    fn only_enabled_channels_are_built() {
        let mut config = Config::default();
        assert!(build_channels(&config).is_empty());
        config.channels.ntfy.enabled = true;
        config.channels.omi.enabled = true;
        let names: Vec<String> = build_channels(&config)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["ntfy".to_string(), "omi".to_string()]);
    }

    #[tokio::test]
    async fn run_without_channels_is_an_error() {
        let err = run(Config::default(), Arc::new(LogHandler)).await.unwrap_err();
        assert!(err.to_string().contains("no channels enabled"));
    }

    #[tokio::test]
    async fn send_once_requires_enabled_channel() {
        let msg = OutboundMessage::new("ntfy", "alerts", "hi");
        let err = send_once(Config::default(), msg).await.unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }
}
