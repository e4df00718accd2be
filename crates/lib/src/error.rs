//! Channel error taxonomy.
//!
//! Most variants never leave an adapter: connection failures are recovered by the
//! reconnect loop and malformed payloads are logged and skipped. `Timeout` and `Rpc`
//! are the ones a caller of an RPC request actually sees.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Required option missing or invalid. Fatal for that channel instance at start.
    #[error("configuration error: {0}")]
    Config(String),
    /// Process exit, stream drop, non-success HTTP status.
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: u64, after: Duration },
    /// Non-JSON line or a payload missing expected fields.
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{0}")]
    ProcessExited(String),
    #[error("{0}")]
    Stopping(String),
    /// Error object returned by the remote side of a JSON-RPC call.
    #[error("rpc error: {0}")]
    Rpc(serde_json::Value),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChannelError {
    pub fn config(msg: impl Into<String>) -> Self {
        ChannelError::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ChannelError::Connection(msg.into())
    }

    /// True for errors the reconnect loop should retry rather than give up on.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ChannelError::Config(_) | ChannelError::Stopping(_))
    }
}
