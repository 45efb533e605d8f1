//! Agent configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/cnc-agent/agent.toml`
//! - Windows: `%APPDATA%/cnc-agent/agent.toml`
//!
//! `CNC_AGENT_CONFIG` points at a different file and `CNC_AGENT_API_TOKEN`
//! overrides the API token.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use cnc_agent_file_ops::DEFAULT_DELETE_PARALLELISM;
use cnc_agent_queue::{ListenerSettings, TransportType};
use cnc_agent_share_auth::AuthMode;
use serde::{Deserialize, Serialize};

const CONFIG_PATH_ENV: &str = "CNC_AGENT_CONFIG";
const API_TOKEN_ENV: &str = "CNC_AGENT_API_TOKEN";

/// Agent configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier this agent is registered under in the control plane.
    pub agent_id: String,

    /// Control-plane base URL.
    pub api_base_url: String,

    /// Bearer token for the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// Transport used to reach the queue.
    #[serde(default)]
    pub transport: TransportType,

    /// Messages processed concurrently.
    #[serde(default = "default_listeners")]
    pub max_concurrent_listeners: usize,

    /// Server-side wait of one queue receive, in seconds.
    #[serde(default = "default_receive_wait_secs")]
    pub receive_wait_secs: u64,

    /// Dead-letter entity; `<queue>-deadletter` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,

    /// Interval between lock renewals of a message being processed, in
    /// seconds. Must be shorter than the queue's lock duration.
    #[serde(default = "default_lock_renewal_secs")]
    pub lock_renewal_secs: u64,

    /// Concurrent deletions when purging a share.
    #[serde(default = "default_delete_parallelism")]
    pub delete_parallelism: usize,

    /// Share authentication mode.
    #[serde(default)]
    pub auth: AuthMode,
}

fn default_listeners() -> usize {
    1
}

fn default_receive_wait_secs() -> u64 {
    30
}

fn default_lock_renewal_secs() -> u64 {
    20
}

fn default_delete_parallelism() -> usize {
    DEFAULT_DELETE_PARALLELISM
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("agent_id", &self.agent_id)
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("transport", &self.transport)
            .field("max_concurrent_listeners", &self.max_concurrent_listeners)
            .field("receive_wait_secs", &self.receive_wait_secs)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("lock_renewal_secs", &self.lock_renewal_secs)
            .field("delete_parallelism", &self.delete_parallelism)
            .field("auth", &self.auth)
            .finish()
    }
}

impl Config {
    /// Loads configuration from the default location.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        let mut config = Self::load_from(&path)?;
        config.apply_token_override(std::env::var(API_TOKEN_ENV).ok());
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration read");
        Ok(config)
    }

    /// Reads and parses the file at `path`. There are no defaults for the
    /// agent identity, so a missing file is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid configuration {}", path.display()))?;
        Ok(config)
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.api_token = Some(token);
        }
    }

    /// Rejects values the agent cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.agent_id.trim().is_empty(), "agent_id must not be empty");
        anyhow::ensure!(
            self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://"),
            "api_base_url must be an http(s) URL, got {:?}",
            self.api_base_url
        );
        anyhow::ensure!(
            self.max_concurrent_listeners >= 1,
            "max_concurrent_listeners must be at least 1"
        );
        anyhow::ensure!(
            self.lock_renewal_secs >= 1,
            "lock_renewal_secs must be at least 1"
        );
        anyhow::ensure!(
            self.delete_parallelism >= 1,
            "delete_parallelism must be at least 1"
        );
        Ok(())
    }

    /// Process-side settings handed to every queue listener.
    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            transport: self.transport,
            max_concurrent_calls: self.max_concurrent_listeners,
            receive_wait: Duration::from_secs(self.receive_wait_secs.max(1)),
            dead_letter_queue: self.dead_letter_queue.clone(),
            lock_renewal: Duration::from_secs(self.lock_renewal_secs),
        }
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\ProgramData".into());
        PathBuf::from(appdata).join("cnc-agent").join("agent.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/etc".into());
        PathBuf::from(home)
            .join(".config")
            .join("cnc-agent")
            .join("agent.toml")
    }
}
