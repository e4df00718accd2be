//! iMessage via the `imsg` CLI: poll `imsg chats` for recent activity, read the latest
//! message of each active chat with `imsg history`, reply with `imsg send`.

use crate::channels::dedup::SeenKey;
use crate::channels::poll::{PollItem, PollSource, PolledMessage, PollingChannel};
use crate::channels::{Metadata, OutboundMessage};
use crate::config::ImsgConfig;
use crate::error::ChannelError;
use crate::exec::{self, find_executable, parse_ndjson};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

const CHAT_LIMIT: &str = "10";

pub type ImsgChannel = PollingChannel<ImsgSource>;

pub struct ImsgSource {
    config: ImsgConfig,
}

impl ImsgSource {
    pub fn new(config: ImsgConfig) -> Self {
        Self { config }
    }

    pub fn into_channel(self) -> ImsgChannel {
        PollingChannel::new(self)
    }
}

/// Chat id as a string; the CLI emits it as a number.
fn chat_id_of(chat: &Value) -> Option<String> {
    match chat.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Turn one `imsg chats --json` line into a poll item. Chats without an id or a parseable
/// `last_message_at` are skipped.
pub fn chat_item(chat: Value) -> Option<PollItem> {
    let id = chat_id_of(&chat)?;
    let last = chat.get("last_message_at")?.as_str()?;
    let at = DateTime::parse_from_rfc3339(last).ok()?.with_timezone(&Utc);
    Some(PollItem {
        key: SeenKey::new(id, at.to_rfc3339()),
        timestamp: Some(at),
        raw: chat,
    })
}

/// Build the message from the chat entry and the newest history entry. Our own messages
/// yield `None`.
pub fn history_message(chat: &Value, entry: &Value) -> Option<PolledMessage> {
    if entry.get("is_from_me").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }
    let sender = entry
        .get("sender")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| chat.get("identifier").and_then(|v| v.as_str()))?
        .to_string();
    let content = entry
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let mut metadata = Metadata::new();
    if let Some(service) = chat.get("service") {
        metadata.insert("service".into(), service.clone());
    }
    if let Some(id) = chat_id_of(chat) {
        metadata.insert("imsg_chat_id".into(), json!(id));
    }
    Some(PolledMessage {
        chat_id: sender.clone(),
        sender_id: sender,
        content,
        media: Vec::new(),
        metadata,
    })
}

/// Arguments for `imsg send`: numeric targets are chat row ids, anything else a handle.
pub fn send_args(target: &str, text: &str) -> Vec<String> {
    let flag = if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
        "--chat-id"
    } else {
        "--to"
    };
    vec![
        "send".into(),
        "--text".into(),
        text.into(),
        flag.into(),
        target.into(),
    ]
}

#[async_trait]
impl PollSource for ImsgSource {
    fn name(&self) -> &str {
        "imsg"
    }

    fn validate(&self) -> Result<(), ChannelError> {
        if find_executable(&self.config.cli_path).is_none() {
            return Err(ChannelError::config(format!(
                "imsg CLI not found: {}",
                self.config.cli_path
            )));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs.max(1))
    }

    async fn fetch_recent(&self) -> Result<Vec<PollItem>, ChannelError> {
        let args: Vec<String> = vec!["chats".into(), "--limit".into(), CHAT_LIMIT.into(), "--json".into()];
        let out = exec::run(&self.config.cli_path, &args).await?;
        Ok(parse_ndjson(&out).into_iter().filter_map(chat_item).collect())
    }

    async fn fetch_detail(&self, item: &PollItem) -> Result<Option<PolledMessage>, ChannelError> {
        let args: Vec<String> = vec![
            "history".into(),
            "--chat-id".into(),
            item.key.source_id.clone(),
            "--limit".into(),
            "1".into(),
            "--json".into(),
        ];
        let out = exec::run(&self.config.cli_path, &args).await?;
        let Some(entry) = parse_ndjson(&out).into_iter().next() else {
            return Ok(None);
        };
        Ok(history_message(&item.raw, &entry))
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let target = msg.chat_id.trim();
        if target.is_empty() {
            return Err(ChannelError::config("imsg send without a recipient"));
        }
        log::debug!("imsg: sending to {}", target);
        exec::run(&self.config.cli_path, &send_args(target, &msg.content)).await?;
        Ok(())
    }
}
