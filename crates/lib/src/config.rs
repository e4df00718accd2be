//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.courier/config.json`) and environment.
//! Every field has a default so a missing file or section is valid; channels with
//! missing credentials simply fail to start.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Channel settings (Signal, ntfy, iMessage, Omi).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Inbound queue settings.
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Inbound queue capacity (default 64).
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

fn default_bus_capacity() -> usize {
    crate::bus::DEFAULT_BUS_CAPACITY
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub ntfy: NtfyConfig,
    #[serde(default)]
    pub imsg: ImsgConfig,
    #[serde(default)]
    pub omi: OmiConfig,
}

/// Signal via `signal-cli jsonRpc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Account phone number (e.g. "+14155551234"). Overridden by SIGNAL_ACCOUNT env when set.
    pub account: Option<String>,
    /// signal-cli binary name or path (default "signal-cli").
    #[serde(default = "default_signal_cli")]
    pub cli_path: String,
    /// Passed as `--config` to signal-cli when set.
    pub config_path: Option<PathBuf>,
    #[serde(default = "default_signal_max_len")]
    pub max_message_length: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account: None,
            cli_path: default_signal_cli(),
            config_path: None,
            max_message_length: default_signal_max_len(),
            request_timeout_secs: default_request_timeout_secs(),
            restart_delay_secs: default_restart_delay_secs(),
        }
    }
}

impl SignalConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

fn default_signal_cli() -> String {
    "signal-cli".to_string()
}

fn default_signal_max_len() -> usize {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_restart_delay_secs() -> u64 {
    5
}

/// ntfy topic: SSE subscription for inbound, HTTP POST for outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtfyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Server base URL (default "https://ntfy.sh").
    #[serde(default = "default_ntfy_server")]
    pub server_url: String,
    pub topic: Option<String>,
    /// Bearer token for protected topics. Overridden by NTFY_AUTH_TOKEN env when set.
    pub auth_token: Option<String>,
    /// Send `Markdown: yes` with published messages.
    #[serde(default)]
    pub markdown: bool,
    /// When false the channel is output-only and never opens the event stream.
    #[serde(default = "default_true")]
    pub subscribe: bool,
    #[serde(default = "default_restart_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_ntfy_max_len")]
    pub max_message_length: usize,
}

impl Default for NtfyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: default_ntfy_server(),
            topic: None,
            auth_token: None,
            markdown: false,
            subscribe: true,
            reconnect_delay_secs: default_restart_delay_secs(),
            max_message_length: default_ntfy_max_len(),
        }
    }
}

impl NtfyConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn default_ntfy_server() -> String {
    "https://ntfy.sh".to_string()
}

fn default_ntfy_max_len() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

/// iMessage via the `imsg` CLI (polling).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImsgConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_imsg_cli")]
    pub cli_path: String,
    #[serde(default = "default_imsg_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ImsgConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cli_path: default_imsg_cli(),
            poll_interval_secs: default_imsg_interval(),
        }
    }
}

fn default_imsg_cli() -> String {
    "imsg".to_string()
}

fn default_imsg_interval() -> u64 {
    2
}

/// Omi wearable conversations (polling).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Developer API key. Overridden by OMI_API_KEY env when set.
    pub api_key: Option<String>,
    #[serde(default = "default_omi_url")]
    pub api_url: String,
    #[serde(default = "default_omi_interval")]
    pub poll_interval_secs: u64,
}

impl Default for OmiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_url: default_omi_url(),
            poll_interval_secs: default_omi_interval(),
        }
    }
}

fn default_omi_url() -> String {
    "https://api.omi.me/v1/dev".to_string()
}

fn default_omi_interval() -> u64 {
    30
}

/// Non-empty trimmed env var, if set.
fn env_override(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the Signal account: env SIGNAL_ACCOUNT overrides config.
pub fn resolve_signal_account(config: &Config) -> Option<String> {
    env_override("SIGNAL_ACCOUNT").or_else(|| non_empty(&config.channels.signal.account))
}

/// Resolve the ntfy token: env NTFY_AUTH_TOKEN overrides config.
pub fn resolve_ntfy_token(config: &Config) -> Option<String> {
    env_override("NTFY_AUTH_TOKEN").or_else(|| non_empty(&config.channels.ntfy.auth_token))
}

/// Resolve the Omi API key: env OMI_API_KEY overrides config.
pub fn resolve_omi_api_key(config: &Config) -> Option<String> {
    env_override("OMI_API_KEY").or_else(|| non_empty(&config.channels.omi.api_key))
}

/// Copy of the config with env overrides applied to channel secrets.
pub fn with_env_overrides(config: &Config) -> Config {
    let mut c = config.clone();
    c.channels.signal.account = resolve_signal_account(config);
    c.channels.ntfy.auth_token = resolve_ntfy_token(config);
    c.channels.omi.api_key = resolve_omi_api_key(config);
    c
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".courier").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or COURIER_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
