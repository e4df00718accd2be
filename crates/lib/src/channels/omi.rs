//! Omi wearable: poll the developer API for new conversations and publish them as
//! messages; replies are stored back as Omi memories.

use crate::channels::dedup::SeenKey;
use crate::channels::poll::{PollItem, PollSource, PolledMessage, PollingChannel};
use crate::channels::{Metadata, OutboundMessage};
use crate::config::OmiConfig;
use crate::error::ChannelError;
use crate::exec::truncate;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_LIMIT: usize = 10;
const SEED_LIMIT: usize = 25;
pub const OMI_SENDER: &str = "omi-wearable";

pub type OmiChannel = PollingChannel<OmiSource>;

/// Minimal client for the Omi developer REST API.
pub struct OmiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OmiClient {
    pub fn new(api_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            base_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn get_conversations(
        &self,
        limit: usize,
        include_transcript: bool,
    ) -> Result<Vec<Value>, ChannelError> {
        let mut url = format!("{}/user/conversations?limit={}&offset=0", self.base_url, limit);
        if include_transcript {
            url.push_str("&include_transcript=true");
        }
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let body = check_status("list conversations", res).await?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(ChannelError::Malformed(format!(
                "expected conversation list, got {}",
                truncate(&other.to_string(), 100)
            ))),
        }
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Value, ChannelError> {
        let url = format!("{}/user/conversations/{}", self.base_url, id);
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status("get conversation", res).await
    }

    pub async fn create_memory(&self, content: &str) -> Result<Value, ChannelError> {
        let url = format!("{}/user/memories", self.base_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        check_status("create memory", res).await
    }
}

async fn check_status(what: &str, res: reqwest::Response) -> Result<Value, ChannelError> {
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ChannelError::connection(format!(
            "omi {} failed: {} {}",
            what,
            status,
            truncate(&body, 200)
        )));
    }
    Ok(res.json().await?)
}

/// Render a conversation as text: title, overview, then transcript lines.
pub fn format_conversation(conv: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(title) = conv.get("title").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        parts.push(format!("Conversation: {}", title));
    }
    if let Some(overview) = conv.get("overview").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        parts.push(overview.to_string());
    }
    if let Some(segments) = conv.get("transcript").and_then(|v| v.as_array()) {
        let lines: Vec<String> = segments
            .iter()
            .filter_map(|seg| {
                let text = seg.get("text").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?;
                let speaker = match seg.get("speaker") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => "?".to_string(),
                };
                Some(format!("[Speaker {}]: {}", speaker, text))
            })
            .collect();
        if !lines.is_empty() {
            parts.push(lines.join("\n"));
        }
    }
    parts.join("\n\n")
}

/// Listing entry to poll item, keyed on the conversation id alone. Entries without an id
/// are skipped.
///
/// No timestamp is attached: a conversation can finish processing after a later one was
/// already listed, so `created_at` order says nothing about what is new.
pub fn conversation_item(conv: Value) -> Option<PollItem> {
    let id = conv.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?.to_string();
    Some(PollItem {
        key: SeenKey::new(id, ""),
        timestamp: None,
        raw: conv,
    })
}

pub struct OmiSource {
    config: OmiConfig,
    client: OmiClient,
}

impl OmiSource {
    pub fn new(config: OmiConfig) -> Self {
        let client = OmiClient::new(&config.api_url, config.api_key.clone().unwrap_or_default());
        Self { config, client }
    }

    pub fn into_channel(self) -> OmiChannel {
        PollingChannel::new(self)
    }

    pub fn client(&self) -> &OmiClient {
        &self.client
    }
}

#[async_trait]
impl PollSource for OmiSource {
    fn name(&self) -> &str {
        "omi"
    }

    fn validate(&self) -> Result<(), ChannelError> {
        let has_key = self
            .config
            .api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false);
        if !has_key {
            return Err(ChannelError::config("omi api key not configured"));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs.max(1))
    }

    async fn fetch_recent(&self) -> Result<Vec<PollItem>, ChannelError> {
        let convs = self.client.get_conversations(POLL_LIMIT, true).await?;
        log::debug!("omi: poll returned {} conversation(s)", convs.len());
        Ok(convs.into_iter().filter_map(conversation_item).collect())
    }

    async fn fetch_seed(&self) -> Result<Vec<PollItem>, ChannelError> {
        let convs = self.client.get_conversations(SEED_LIMIT, false).await?;
        Ok(convs.into_iter().filter_map(conversation_item).collect())
    }

    async fn fetch_detail(&self, item: &PollItem) -> Result<Option<PolledMessage>, ChannelError> {
        let id = item.key.source_id.as_str();
        let full;
        let conv = if item.raw.get("transcript").map_or(true, |t| t.is_null()) {
            full = self.client.get_conversation(id).await?;
            &full
        } else {
            &item.raw
        };
        let content = format_conversation(conv);
        if content.is_empty() {
            return Ok(None);
        }
        let mut metadata = Metadata::new();
        metadata.insert("conversation_id".into(), json!(id));
        metadata.insert(
            "title".into(),
            conv.get("title").cloned().unwrap_or_else(|| json!("")),
        );
        metadata.insert(
            "category".into(),
            conv.get("category").cloned().unwrap_or_else(|| json!("")),
        );
        Ok(Some(PolledMessage {
            sender_id: OMI_SENDER.to_string(),
            chat_id: id.to_string(),
            content,
            media: Vec::new(),
            metadata,
        }))
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        self.client.create_memory(&msg.content).await?;
        log::debug!(
            "omi: created memory from response ({} chars)",
            msg.content.chars().count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_title_overview_and_transcript() {
        let conv = json!({
            "id": "c1",
            "title": "Standup",
            "overview": "Discussed the release.",
            "transcript": [
                {"speaker": 0, "text": "Ship it Friday."},
                {"speaker": "SPEAKER_01", "text": "Agreed."},
                {"speaker": 2, "text": ""},
                {"text": "Who said this?"}
            ]
        });
        assert_eq!(
            format_conversation(&conv),
            "Conversation: Standup\n\nDiscussed the release.\n\n[Speaker 0]: Ship it Friday.\n[Speaker SPEAKER_01]: Agreed.\n[Speaker ?]: Who said this?"
        );
    }

    #[test]
    fn empty_conversation_formats_to_nothing() {
        assert_eq!(format_conversation(&json!({"id": "c2", "transcript": []})), "");
    }

    #[test]
    fn items_are_keyed_on_id_only() {
        let item = conversation_item(json!({"id": "c1", "created_at": "2026-03-01T12:00:00+00:00"})).unwrap();
        assert_eq!(item.key, SeenKey::new("c1", ""));
        assert!(item.timestamp.is_none());
        assert!(conversation_item(json!({"title": "no id"})).is_none());
    }

    #[test]
    fn late_processed_conversation_is_still_new() {
        let mut state = crate::channels::poll::PollState::new(100);
        let seed: Vec<PollItem> = [json!({"id": "c5", "created_at": "2026-03-01T12:00:00Z"})]
            .into_iter()
            .filter_map(conversation_item)
            .collect();
        state.seed(&seed, chrono::Utc::now());

        let listing: Vec<PollItem> = [
            json!({"id": "c5", "created_at": "2026-03-01T12:00:00Z"}),
            json!({"id": "c4", "created_at": "2026-03-01T11:00:00Z"}),
        ]
        .into_iter()
        .filter_map(conversation_item)
        .collect();
        let fresh = state.select(listing);
        let ids: Vec<&str> = fresh.iter().map(|i| i.key.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c4"]);
    }

    #[test]
    fn missing_key_fails_validation() {
        let source = OmiSource::new(OmiConfig {
            api_key: Some("  ".into()),
            ..OmiConfig::default()
        });
        assert!(matches!(source.validate(), Err(ChannelError::Config(_))));
        let source = OmiSource::new(OmiConfig {
            api_key: Some("key".into()),
            ..OmiConfig::default()
        });
        assert!(source.validate().is_ok());
    }
}
