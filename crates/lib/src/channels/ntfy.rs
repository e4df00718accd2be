//! ntfy channel: inbound over the topic's server-sent-event stream, outbound as plain
//! HTTP publishes.
//!
//! The subscription reconnects with a fixed delay and resumes with `since=<last id>` so
//! messages published during the gap are replayed. Replays are filtered by id. Our own
//! publishes carry a per-instance tag, so their echoes are recognised even when the
//! frame arrives before the publish response.

use crate::bus::Publisher;
use crate::channels::chunk::split_message;
use crate::channels::dedup::DedupWindow;
use crate::channels::lifecycle::{ConnectionEvent, ConnectionState, Lifecycle, StopWatcher};
use crate::channels::registry::Channel;
use crate::channels::sse::SseParser;
use crate::channels::{Metadata, OutboundMessage};
use crate::config::NtfyConfig;
use crate::error::ChannelError;
use crate::exec::truncate;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const DEDUP_CAPACITY: usize = 1000;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);

/// One JSON frame from the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct NtfyEvent {
    #[serde(default)]
    pub id: String,
    pub time: Option<i64>,
    pub event: String,
    pub topic: Option<String>,
    pub message: Option<String>,
    pub title: Option<String>,
    pub priority: Option<u8>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub attachment: Option<NtfyAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NtfyAttachment {
    pub name: Option<String>,
    pub url: String,
}

/// Decode a data payload. `Ok(None)` for non-message events (open, keepalive, poll_request).
pub fn parse_frame(data: &str) -> Result<Option<NtfyEvent>, ChannelError> {
    let event: NtfyEvent = serde_json::from_str(data)
        .map_err(|e| ChannelError::Malformed(format!("ntfy frame: {}", e)))?;
    if event.event != "message" {
        return Ok(None);
    }
    Ok(Some(event))
}

enum StreamEnd {
    /// Server closed the stream; reconnect.
    Closed,
    /// Channel stopped or bus closed; exit the loop.
    Stopped,
}

pub struct NtfyChannel {
    config: NtfyConfig,
    base_url: String,
    client: reqwest::Client,
    lifecycle: Lifecycle,
    reconnect_delay: Duration,
    /// Tag attached to every publish from this instance.
    marker: String,
    /// Ids of messages this channel published, so the subscription skips its own echoes.
    published: Mutex<DedupWindow<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NtfyChannel {
    pub fn new(config: NtfyConfig) -> Self {
        let base_url = config.server_url.trim_end_matches('/').to_string();
        let reconnect_delay = config.reconnect_delay();
        Self {
            config,
            base_url,
            client: reqwest::Client::new(),
            lifecycle: Lifecycle::new("ntfy"),
            reconnect_delay,
            marker: format!("courier-{}", uuid::Uuid::new_v4().simple()),
            published: Mutex::new(DedupWindow::new(DEDUP_CAPACITY)),
            task: Mutex::new(None),
        }
    }

    /// Override the configured (whole-second) reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn topic(&self) -> &str {
        self.config.topic.as_deref().unwrap_or("").trim()
    }

    fn validate(&self) -> Result<(), ChannelError> {
        if self.topic().is_empty() {
            return Err(ChannelError::config("ntfy topic not configured"));
        }
        reqwest::Url::parse(&self.base_url).map_err(|e| {
            ChannelError::config(format!("invalid ntfy server url '{}': {}", self.base_url, e))
        })?;
        Ok(())
    }

    fn subscribe_url(&self, since: Option<&str>) -> String {
        let url = format!("{}/{}/sse", self.base_url, self.topic());
        match since {
            Some(id) => format!("{}?since={}", url, id),
            None => url,
        }
    }

    /// Tag our publishes carry; frames with it are echoes of our own messages.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn is_own_message(&self, event: &NtfyEvent) -> bool {
        if event.tags.iter().any(|t| t == &self.marker) {
            return true;
        }
        !event.id.is_empty()
            && self
                .published
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&event.id)
    }

    async fn run_stream(self: Arc<Self>, publisher: Publisher) {
        let mut watcher = self.lifecycle.watcher();
        let mut seen = DedupWindow::new(DEDUP_CAPACITY);
        let mut since: Option<String> = None;
        while watcher.is_running() {
            match self
                .consume_stream(&publisher, &mut watcher, &mut seen, &mut since)
                .await
            {
                Ok(StreamEnd::Stopped) => break,
                Ok(StreamEnd::Closed) => log::warn!("ntfy: event stream closed"),
                Err(e) => log::warn!("ntfy: event stream failed: {}", e),
            }
            if !watcher.is_running() {
                break;
            }
            self.lifecycle.transition(ConnectionEvent::Failed);
            log::info!("ntfy: reconnecting in {:?}", self.reconnect_delay);
            if !watcher.sleep(self.reconnect_delay).await {
                break;
            }
            self.lifecycle.transition(ConnectionEvent::BackoffElapsed);
        }
        log::info!("ntfy: subscription loop stopped");
    }

    /// One connection: subscribe, read frames until the stream ends, fails or we stop.
    async fn consume_stream(
        &self,
        publisher: &Publisher,
        watcher: &mut StopWatcher,
        seen: &mut DedupWindow<String>,
        since: &mut Option<String>,
    ) -> Result<StreamEnd, ChannelError> {
        let mut req = self.client.get(self.subscribe_url(since.as_deref()));
        if let Some(ref token) = self.config.auth_token {
            req = req.bearer_auth(token);
        }
        let res = tokio::select! {
            res = req.send() => res?,
            _ = watcher.stopped() => return Ok(StreamEnd::Stopped),
        };
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::connection(format!(
                "subscribe failed: {} {}",
                status,
                truncate(&body, 200)
            )));
        }
        self.lifecycle.transition(ConnectionEvent::Established);
        log::info!("ntfy: subscribed to {}", self.topic());

        let mut stream = res.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = watcher.stopped() => return Ok(StreamEnd::Stopped),
            };
            let Some(chunk) = chunk else {
                return Ok(StreamEnd::Closed);
            };
            for data in parser.feed(&chunk?)? {
                let event = match parse_frame(&data) {
                    Ok(Some(e)) => e,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("ntfy: skipping frame: {}", e);
                        continue;
                    }
                };
                if !event.id.is_empty() {
                    *since = Some(event.id.clone());
                    if !seen.insert(event.id.clone()) {
                        log::debug!("ntfy: duplicate message {}", event.id);
                        continue;
                    }
                }
                if self.is_own_message(&event) {
                    log::debug!("ntfy: skipping own message {}", event.id);
                    continue;
                }
                let published = tokio::select! {
                    ok = self.publish_event(publisher, event) => ok,
                    _ = watcher.stopped() => false,
                };
                if !published {
                    return Ok(StreamEnd::Stopped);
                }
            }
        }
    }

    async fn publish_event(&self, publisher: &Publisher, event: NtfyEvent) -> bool {
        let topic = event
            .topic
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.topic().to_string());
        let content = event.message.clone().unwrap_or_default();
        let media: Vec<String> = event.attachment.iter().map(|a| a.url.clone()).collect();
        if content.is_empty() && media.is_empty() {
            return true;
        }
        let mut metadata = Metadata::new();
        metadata.insert("message_id".into(), json!(event.id));
        metadata.insert("time".into(), json!(event.time));
        if let Some(ref title) = event.title {
            metadata.insert("title".into(), json!(title));
        }
        if let Some(priority) = event.priority {
            metadata.insert("priority".into(), json!(priority));
        }
        if !event.tags.is_empty() {
            metadata.insert("tags".into(), json!(event.tags));
        }
        log::info!("ntfy: message on {}: {}", topic, truncate(&content, 50));
        publisher.publish(&topic, &topic, &content, media, metadata).await
    }

    /// POST one message body to a topic. Returns the id the server assigned, if any.
    async fn publish_text(
        &self,
        topic: &str,
        text: &str,
        msg: &OutboundMessage,
    ) -> Result<Option<String>, ChannelError> {
        let url = format!("{}/{}", self.base_url, topic);
        let mut req = self
            .client
            .post(&url)
            .timeout(PUBLISH_TIMEOUT)
            .header("Content-Type", "text/plain")
            .header("Tags", &self.marker)
            .body(text.to_string());
        if self.config.markdown {
            req = req.header("Markdown", "yes");
        }
        if let Some(priority) = msg.metadata.get("priority").and_then(header_value) {
            req = req.header("Priority", priority);
        }
        if let Some(title) = msg.metadata_str("title") {
            req = req.header("Title", title);
        }
        if let Some(ref token) = self.config.auth_token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::connection(format!(
                "publish failed: {} {}",
                status,
                truncate(&body, 200)
            )));
        }
        let body: Value = res.json().await.unwrap_or(Value::Null);
        Ok(body.get("id").and_then(|v| v.as_str()).map(String::from))
    }
}

/// Render a metadata value as a header value: strings as-is, numbers via Display.
fn header_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Channel for NtfyChannel {
    fn name(&self) -> &str {
        "ntfy"
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    fn start(self: Arc<Self>, publisher: Publisher) -> Result<(), ChannelError> {
        if self.lifecycle.is_running() {
            return Ok(());
        }
        self.validate()?;
        if !self.lifecycle.begin() {
            return Ok(());
        }
        if !self.config.subscribe {
            self.lifecycle.transition(ConnectionEvent::Established);
            log::info!("ntfy: channel ready, output-only (topic: {})", self.topic());
            return Ok(());
        }
        log::info!("ntfy: subscribing to {}", self.topic());
        let handle = tokio::spawn(self.clone().run_stream(publisher));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.lifecycle.stop();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn send(&self, msg: OutboundMessage) {
        if msg.content.is_empty() {
            return;
        }
        let topic = if msg.chat_id.trim().is_empty() {
            self.topic().to_string()
        } else {
            msg.chat_id.trim().to_string()
        };
        if topic.is_empty() {
            log::error!("ntfy: no topic to publish to");
            return;
        }
        for chunk in split_message(&msg.content, self.config.max_message_length) {
            match self.publish_text(&topic, &chunk, &msg).await {
                Ok(id) => {
                    log::debug!("ntfy: published message ({} chars)", chunk.chars().count());
                    if let Some(id) = id {
                        self.published
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(id);
                    }
                }
                Err(e) => log::error!("ntfy: failed to publish message: {}", e),
            }
        }
    }
}
