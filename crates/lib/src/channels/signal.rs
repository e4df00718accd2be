//! Signal channel: a persistent `signal-cli jsonRpc` subprocess.
//!
//! Inbound envelopes arrive as JSON-RPC notifications (or bare envelopes on older
//! signal-cli versions), are deduplicated on `(source, timestamp)` and published.
//! Replies go out as `send` requests, chunked to the configured length.

use crate::bus::Publisher;
use crate::channels::chunk::split_message;
use crate::channels::dedup::{DedupWindow, SeenKey};
use crate::channels::lifecycle::{ConnectionState, Lifecycle, StopWatcher};
use crate::channels::registry::Channel;
use crate::channels::rpc::{CommandSpec, RpcSupervisor, SupervisorOptions};
use crate::channels::{Metadata, OutboundMessage};
use crate::config::SignalConfig;
use crate::error::ChannelError;
use crate::exec::{find_executable, truncate};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DEDUP_CAPACITY: usize = 1000;
const CHUNK_PAUSE: Duration = Duration::from_millis(500);
/// Envelopes buffered between the stdout reader and the bus.
const EVENT_QUEUE_CAPACITY: usize = crate::bus::DEFAULT_BUS_CAPACITY;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    source: Option<String>,
    source_number: Option<String>,
    timestamp: Option<i64>,
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataMessage {
    message: Option<String>,
    body: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    group_info: Option<GroupInfo>,
    group: Option<GroupInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attachment {
    filename: Option<String>,
    id: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupInfo {
    group_id: Option<String>,
}

/// A data message extracted from an envelope, ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub source: String,
    pub timestamp: Option<i64>,
    pub text: String,
    pub media: Vec<String>,
    pub group_id: Option<String>,
}

impl SignalMessage {
    pub fn chat_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.source)
    }

    pub fn dedup_key(&self) -> Option<SeenKey> {
        self.timestamp.map(|ts| SeenKey::new(self.source.clone(), ts))
    }

    fn metadata(&self) -> Metadata {
        let mut m = Metadata::new();
        m.insert("timestamp".into(), json!(self.timestamp));
        m.insert("is_group".into(), json!(self.group_id.is_some()));
        m.insert("group_id".into(), json!(self.group_id));
        m
    }
}

/// Extract the publishable message from an envelope. `Ok(None)` for envelopes without a
/// sender or without content (receipts, typing indicators).
pub fn parse_envelope(envelope: &Value) -> Result<Option<SignalMessage>, ChannelError> {
    let env: Envelope = serde_json::from_value(envelope.clone())
        .map_err(|e| ChannelError::Malformed(format!("signal envelope: {}", e)))?;
    let Some(source) = env
        .source
        .filter(|s| !s.is_empty())
        .or(env.source_number.filter(|s| !s.is_empty()))
    else {
        return Ok(None);
    };
    let Some(data) = env.data_message else {
        return Ok(None);
    };

    let mut text = data
        .message
        .filter(|s| !s.is_empty())
        .or(data.body.filter(|s| !s.is_empty()))
        .unwrap_or_default();

    let mut media = Vec::new();
    for att in data.attachments {
        let path = att.filename.or(att.id).unwrap_or_default();
        if path.is_empty() {
            continue;
        }
        media.push(path);
        if text.is_empty() {
            text = format!("[{}]", att.content_type.as_deref().unwrap_or("attachment"));
        }
    }

    let group_id = data
        .group_info
        .or(data.group)
        .and_then(|g| g.group_id)
        .filter(|g| !g.is_empty());

    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(SignalMessage {
        source,
        timestamp: env.timestamp,
        text,
        media,
        group_id,
    }))
}

/// Build the `signal-cli [--config DIR] -a ACCOUNT jsonRpc` command line.
pub fn signal_cli_command(config: &SignalConfig) -> CommandSpec {
    let mut args = Vec::new();
    if let Some(ref dir) = config.config_path {
        args.push("--config".to_string());
        args.push(dir.display().to_string());
    }
    args.push("-a".to_string());
    args.push(config.account.clone().unwrap_or_default());
    args.push("jsonRpc".to_string());
    CommandSpec::new(config.cli_path.clone(), args)
}

/// Parameters for the `send` method: group messages address the group id, direct
/// messages a single recipient.
pub fn send_params(chat_id: &str, text: &str, is_group: bool) -> Value {
    if is_group {
        json!({ "message": text, "groupId": chat_id })
    } else {
        json!({ "message": text, "recipient": [chat_id] })
    }
}

pub struct SignalChannel {
    config: SignalConfig,
    lifecycle: Lifecycle,
    supervisor: Arc<RpcSupervisor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalChannel {
    pub fn new(config: SignalConfig) -> Self {
        let command = signal_cli_command(&config);
        Self::with_command(config, command)
    }

    /// Use a custom command line (e.g. signal-cli wrapped in a container or ssh invocation).
    pub fn with_command(config: SignalConfig, command: CommandSpec) -> Self {
        let lifecycle = Lifecycle::new("signal");
        let options = SupervisorOptions {
            request_timeout: config.request_timeout(),
            restart_delay: config.restart_delay(),
            ..SupervisorOptions::default()
        };
        let supervisor = Arc::new(RpcSupervisor::new(
            "signal-cli",
            command,
            options,
            lifecycle.clone(),
        ));
        Self {
            config,
            lifecycle,
            supervisor,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<RpcSupervisor> {
        &self.supervisor
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn validate(&self) -> Result<(), ChannelError> {
        let account = self.config.account.as_deref().unwrap_or("").trim();
        if account.is_empty() {
            return Err(ChannelError::config(
                "signal account number not configured (e.g. +14155551234)",
            ));
        }
        let program = &self.supervisor.command().program;
        if find_executable(program).is_none() {
            return Err(ChannelError::config(format!(
                "signal-cli not found at '{}'; install it from https://github.com/AsamK/signal-cli",
                program
            )));
        }
        Ok(())
    }

    async fn send_chunk(&self, chat_id: &str, text: &str, is_group: bool) -> Result<Value, ChannelError> {
        self.supervisor
            .request("send", send_params(chat_id, text, is_group))
            .await
    }
}

/// Consume envelopes from the reader, dedup and publish. Owns the seen-set.
async fn handle_events(
    mut events: mpsc::Receiver<Value>,
    publisher: Publisher,
    mut watcher: StopWatcher,
) {
    let mut seen = DedupWindow::new(DEDUP_CAPACITY);
    loop {
        let envelope = tokio::select! {
            envelope = events.recv() => envelope,
            _ = watcher.stopped() => break,
        };
        let Some(envelope) = envelope else {
            break;
        };
        let msg = match parse_envelope(&envelope) {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("signal: {}", e);
                continue;
            }
        };
        if let Some(key) = msg.dedup_key() {
            if !seen.insert(key) {
                log::debug!("signal: duplicate message from {} at {:?}", msg.source, msg.timestamp);
                continue;
            }
        }
        log::info!("signal: message from {}: {}", msg.source, truncate(&msg.text, 50));
        let metadata = msg.metadata();
        let published = tokio::select! {
            ok = publisher.publish(&msg.source, msg.chat_id(), &msg.text, msg.media.clone(), metadata) => ok,
            _ = watcher.stopped() => false,
        };
        if !published {
            break;
        }
    }
}

#[async_trait]
impl Channel for SignalChannel {
    fn name(&self) -> &str {
        "signal"
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
        log::info!(
            "signal: starting signal-cli JSON-RPC for {}",
            self.config.account.as_deref().unwrap_or("")
        );
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let supervisor = tokio::spawn(self.supervisor.clone().run(events_tx));
        let handler = tokio::spawn(handle_events(events_rx, publisher, self.lifecycle.watcher()));
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(supervisor);
        tasks.push(handler);
        Ok(())
    }

    async fn stop(&self) {
        self.supervisor
            .fail_pending(|| ChannelError::Stopping("channel stopping".to_string()));
        self.lifecycle.stop();
        let tasks: Vec<JoinHandle<()>> = {
            let mut g = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *g)
        };
        for t in tasks {
            let _ = t.await;
        }
    }

    async fn send(&self, msg: OutboundMessage) {
        if msg.content.is_empty() {
            return;
        }
        if !self.lifecycle.is_running() {
            log::warn!("signal: channel not running, cannot send to {}", msg.chat_id);
            return;
        }
        let is_group = msg.metadata_bool("is_group");
        let chunks = split_message(&msg.content, self.config.max_message_length);
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(CHUNK_PAUSE).await;
            }
            match self.send_chunk(&msg.chat_id, chunk, is_group).await {
                Ok(_) => log::debug!("signal: message sent to {}", msg.chat_id),
                Err(e) => log::error!("signal: sending to {} failed: {}", msg.chat_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn direct_message_envelope() {
        let env = json!({
            "source": "+14155550001",
            "timestamp": 1700000000123_i64,
            "dataMessage": { "message": "hello there", "groupInfo": null }
        });
        let msg = parse_envelope(&env).unwrap().unwrap();
        assert_eq!(msg.source, "+14155550001");
        assert_eq!(msg.chat_id(), "+14155550001");
        assert_eq!(msg.text, "hello there");
        assert_eq!(msg.dedup_key(), Some(SeenKey::new("+14155550001", 1700000000123_i64)));
        let meta = msg.metadata();
        assert_eq!(meta["is_group"], json!(false));
    }

    #[test]
    fn group_message_routes_to_group_id() {
        let env = json!({
            "sourceNumber": "+14155550002",
            "timestamp": 5,
            "dataMessage": { "body": "hi all", "groupInfo": { "groupId": "Z3JvdXA=" } }
        });
        let msg = parse_envelope(&env).unwrap().unwrap();
        assert_eq!(msg.source, "+14155550002");
        assert_eq!(msg.chat_id(), "Z3JvdXA=");
        assert_eq!(msg.metadata()["group_id"], json!("Z3JvdXA="));
    }

    #[test]
    fn attachment_only_message_gets_placeholder() {
        let env = json!({
            "source": "+1",
            "timestamp": 9,
            "dataMessage": {
                "attachments": [
                    { "contentType": "image/jpeg", "filename": "/tmp/a.jpg" },
                    { "id": "att-2" },
                    {}
                ]
            }
        });
        let msg = parse_envelope(&env).unwrap().unwrap();
        assert_eq!(msg.text, "[image/jpeg]");
        assert_eq!(msg.media, vec!["/tmp/a.jpg".to_string(), "att-2".to_string()]);
    }

    #[test]
    fn receipts_and_anonymous_envelopes_are_skipped() {
        let receipt = json!({"source": "+1", "timestamp": 3, "receiptMessage": {"isRead": true}});
        assert_eq!(parse_envelope(&receipt).unwrap(), None);
        let anonymous = json!({"timestamp": 3, "dataMessage": {"message": "x"}});
        assert_eq!(parse_envelope(&anonymous).unwrap(), None);
        let empty = json!({"source": "+1", "dataMessage": {"message": ""}});
        assert_eq!(parse_envelope(&empty).unwrap(), None);
    }

    #[test]
    fn ill_typed_envelope_is_malformed() {
        let bad = json!({"source": "+1", "timestamp": "yesterday"});
        assert!(matches!(parse_envelope(&bad), Err(ChannelError::Malformed(_))));
    }

    #[test]
    fn command_line_and_send_params() {
        let config = SignalConfig {
            account: Some("+14155551234".into()),
            config_path: Some(PathBuf::from("/var/lib/signal")),
            ..SignalConfig::default()
        };
        let cmd = signal_cli_command(&config);
        assert_eq!(cmd.program, "signal-cli");
        assert_eq!(
            cmd.args,
            vec!["--config", "/var/lib/signal", "-a", "+14155551234", "jsonRpc"]
        );

        assert_eq!(
            send_params("+1", "hi", false),
            json!({"message": "hi", "recipient": ["+1"]})
        );
        assert_eq!(
            send_params("Z3JvdXA=", "hi", true),
            json!({"message": "hi", "groupId": "Z3JvdXA="})
        );
    }

    #[tokio::test]
    async fn start_without_account_fails_fast() {
        let channel = Arc::new(SignalChannel::new(SignalConfig::default()));
        let (bus, _rx) = crate::bus::MessageBus::new(4);
        let err = channel.clone().start(bus.publisher("signal")).unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
        assert!(!channel.is_running());
        channel.stop().await;
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails_fast() {
        let config = SignalConfig {
            account: Some("+14155551234".into()),
            cli_path: "/nonexistent/signal-cli".into(),
            ..SignalConfig::default()
        };
        let channel = Arc::new(SignalChannel::new(config));
        let (bus, _rx) = crate::bus::MessageBus::new(4);
        assert!(channel.clone().start(bus.publisher("signal")).is_err());
        assert!(!channel.is_running());
    }
}
