//! Polling channel: fetch a recent-activity listing on an interval and publish what is new.
//!
//! "New" means not in the dedup window and, when the item carries a timestamp, strictly
//! newer than the watermark. The watermark only moves forward. On start the first listing
//! is recorded without publishing, so existing history is not replayed.

use crate::bus::Publisher;
use crate::channels::dedup::{DedupWindow, SeenKey};
use crate::channels::lifecycle::{ConnectionEvent, ConnectionState, Lifecycle};
use crate::channels::registry::Channel;
use crate::channels::{Metadata, OutboundMessage};
use crate::error::ChannelError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const DEDUP_CAPACITY: usize = 1000;

/// One entry of a recent-activity listing.
#[derive(Debug, Clone)]
pub struct PollItem {
    pub key: SeenKey,
    pub timestamp: Option<DateTime<Utc>>,
    /// The listing entry as returned by the backend, for `fetch_detail`.
    pub raw: Value,
}

/// A message ready to publish.
#[derive(Debug, Clone, Default)]
pub struct PolledMessage {
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub media: Vec<String>,
    pub metadata: Metadata,
}

/// Backend queried by a [`PollingChannel`].
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Check required configuration. Called once by `start`.
    fn validate(&self) -> Result<(), ChannelError>;

    fn poll_interval(&self) -> Duration;

    /// Recent activity, newest first where the backend allows.
    async fn fetch_recent(&self) -> Result<Vec<PollItem>, ChannelError>;

    /// Listing used to seed the dedup window at startup.
    async fn fetch_seed(&self) -> Result<Vec<PollItem>, ChannelError> {
        self.fetch_recent().await
    }

    /// Resolve a new item into a message. `Ok(None)` skips it (e.g. our own message).
    async fn fetch_detail(&self, item: &PollItem) -> Result<Option<PolledMessage>, ChannelError>;

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Highest item timestamp published so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark(Option<DateTime<Utc>>);

impl Watermark {
    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// Move forward to `ts`. Returns false (and changes nothing) if `ts` is not later.
    pub fn advance(&mut self, ts: DateTime<Utc>) -> bool {
        match self.0 {
            Some(current) if ts <= current => false,
            _ => {
                self.0 = Some(ts);
                true
            }
        }
    }

    pub fn is_newer(&self, ts: DateTime<Utc>) -> bool {
        self.0.map_or(true, |current| ts > current)
    }
}

/// Dedup window plus watermark; owned by the polling loop.
#[derive(Debug)]
pub struct PollState {
    seen: DedupWindow<SeenKey>,
    watermark: Watermark,
}

impl PollState {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: DedupWindow::new(capacity),
            watermark: Watermark::default(),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Record a startup listing without publishing anything. The watermark becomes the
    /// newest timestamp in it, or `now` when it has none.
    pub fn seed(&mut self, items: &[PollItem], now: DateTime<Utc>) {
        for item in items {
            self.seen.insert(item.key.clone());
        }
        let newest = items.iter().filter_map(|i| i.timestamp).max();
        self.watermark.advance(newest.unwrap_or(now));
    }

    /// Record a listing and return the items to publish, in listing order.
    pub fn select(&mut self, items: Vec<PollItem>) -> Vec<PollItem> {
        let mut fresh = Vec::new();
        let mut batch_max: Option<DateTime<Utc>> = None;
        for item in items {
            if !self.seen.insert(item.key.clone()) {
                continue;
            }
            match item.timestamp {
                Some(ts) => {
                    batch_max = Some(batch_max.map_or(ts, |m| m.max(ts)));
                    if self.watermark.is_newer(ts) {
                        fresh.push(item);
                    }
                }
                None => fresh.push(item),
            }
        }
        if let Some(ts) = batch_max {
            self.watermark.advance(ts);
        }
        fresh
    }

    pub fn is_seen(&self, key: &SeenKey) -> bool {
        self.seen.contains(key)
    }
}

pub struct PollingChannel<S: PollSource> {
    source: Arc<S>,
    lifecycle: Lifecycle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: PollSource> PollingChannel<S> {
    pub fn new(source: S) -> Self {
        let lifecycle = Lifecycle::new(source.name());
        Self {
            source: Arc::new(source),
            lifecycle,
            task: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(self: Arc<Self>, publisher: Publisher) {
        let name = self.source.name().to_string();
        let mut watcher = self.lifecycle.watcher();
        let mut state = PollState::new(DEDUP_CAPACITY);

        let seed = tokio::select! {
            res = self.source.fetch_seed() => res,
            _ = watcher.stopped() => return,
        };
        match seed {
            Ok(items) => {
                log::info!("{}: seeded {} item(s)", name, items.len());
                state.seed(&items, Utc::now());
            }
            Err(e) => {
                log::warn!("{}: seeding failed, starting from now: {}", name, e);
                state.seed(&[], Utc::now());
            }
        }
        self.lifecycle.transition(ConnectionEvent::Established);

        let interval = self.source.poll_interval();
        while watcher.sleep(interval).await {
            self.lifecycle.transition(ConnectionEvent::BackoffElapsed);
            let listing = tokio::select! {
                res = self.source.fetch_recent() => res,
                _ = watcher.stopped() => break,
            };
            let items = match listing {
                Ok(items) => items,
                Err(e) => {
                    log_poll_error(&name, "fetch failed", &e);
                    self.lifecycle.transition(ConnectionEvent::Failed);
                    continue;
                }
            };
            self.lifecycle.transition(ConnectionEvent::Established);
            for item in state.select(items) {
                if !watcher.is_running() {
                    break;
                }
                let detail = tokio::select! {
                    res = self.source.fetch_detail(&item) => res,
                    _ = watcher.stopped() => break,
                };
                let msg = match detail {
                    Ok(Some(msg)) => msg,
                    Ok(None) => continue,
                    Err(e) => {
                        log_poll_error(&name, "detail fetch failed", &e);
                        continue;
                    }
                };
                log::info!(
                    "{}: message from {}: {}",
                    name,
                    msg.sender_id,
                    crate::exec::truncate(&msg.content, 50)
                );
                let published = tokio::select! {
                    ok = publisher.publish(&msg.sender_id, &msg.chat_id, &msg.content, msg.media, msg.metadata) => ok,
                    _ = watcher.stopped() => break,
                };
                if !published {
                    log::info!("{}: bus closed, polling stopped", name);
                    return;
                }
            }
        }
        log::info!("{}: polling stopped", name);
    }
}

fn log_poll_error(name: &str, what: &str, e: &ChannelError) {
    if e.is_transient() {
        log::warn!("{}: {}: {}", name, what, e);
    } else {
        log::error!("{}: {}: {}", name, what, e);
    }
}

#[async_trait]
impl<S: PollSource> Channel for PollingChannel<S> {
    fn name(&self) -> &str {
        self.source.name()
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
        self.source.validate()?;
        if !self.lifecycle.begin() {
            return Ok(());
        }
        log::info!(
            "{}: polling every {:?}",
            self.source.name(),
            self.source.poll_interval()
        );
        let handle = tokio::spawn(self.clone().run(publisher));
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
        if let Err(e) = self.source.send(&msg).await {
            log::error!("{}: failed to send message: {}", self.source.name(), e);
        }
    }
}
