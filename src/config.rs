//! Beacon configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BeaconError, Result};

/// Top-level configuration for one plugin instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Prefix for every broker key (`<prefix>:api:...`)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Agent type this instance reports for (e.g. "opencode"). Names the
    /// primary and control channels unless `[channels]` sets them.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,

    /// Origin tag stamped on legacy-channel payloads
    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default)]
    pub channels: ChannelConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub redis: RedisSection,
}

/// Broker channel names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Per-agent-type status channel, `<agent_type>:events`
    #[serde(default = "default_primary_channel")]
    pub primary: String,

    /// Generic event-store channel
    #[serde(default = "default_event_store_channel")]
    pub event_store: String,

    /// Legacy-compatible channel
    #[serde(default = "default_legacy_channel")]
    pub legacy: String,

    /// Global control channel, `<agent_type>:control`; the workspace-scoped
    /// one is `<control>:<base64(path)>`
    #[serde(default = "default_control_channel")]
    pub control: String,

    /// Human-facing notification channel
    #[serde(default = "default_notifications_channel")]
    pub notifications: String,
}

/// Debounce and heartbeat timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

/// Presence lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Expiry of an instance record
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Re-write cadence of an instance record
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Expiry of the per-workspace instance index set
    #[serde(default = "default_index_ttl_secs")]
    pub index_ttl_secs: u64,
}

/// Status poll server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind; the port is always ephemeral
    #[serde(default = "default_host")]
    pub host: String,
}

/// Safety rule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Branches on which mutating tools are blocked
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,

    /// Block every tool while the workspace has uncommitted changes
    #[serde(default)]
    pub require_clean_branch: bool,

    /// Substrings that mark a bash command as destructive
    #[serde(default = "default_dangerous_commands")]
    pub dangerous_commands: Vec<String>,

    /// Ceiling of concurrently active sessions per workspace (0 disables the rule)
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSection {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_key_prefix() -> String {
    "devsuite".to_string()
}

fn default_agent_type() -> String {
    "opencode".to_string()
}

fn default_source() -> String {
    "opencode-plugin".to_string()
}

fn default_primary_channel() -> String {
    primary_channel_for(&default_agent_type())
}

fn primary_channel_for(agent_type: &str) -> String {
    format!("{}:events", agent_type)
}

fn control_channel_for(agent_type: &str) -> String {
    format!("{}:control", agent_type)
}

fn default_event_store_channel() -> String {
    "events:new".to_string()
}

fn default_legacy_channel() -> String {
    "agent:events".to_string()
}

fn default_control_channel() -> String {
    control_channel_for(&default_agent_type())
}

fn default_notifications_channel() -> String {
    "notifications".to_string()
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_refresh_secs() -> u64 {
    30
}

fn default_index_ttl_secs() -> u64 {
    3600
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

fn default_dangerous_commands() -> Vec<String> {
    [
        "rm -rf /",
        "sudo rm",
        "git push --force",
        "git push -f",
        "git reset --hard",
        "git clean -fd",
        "mkfs",
        "dd if=",
        "chmod -R 777",
        "DROP TABLE",
        "DROP DATABASE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_concurrent_sessions() -> usize {
    3
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_channel(),
            event_store: default_event_store_channel(),
            legacy: default_legacy_channel(),
            control: default_control_channel(),
            notifications: default_notifications_channel(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl TimingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            refresh_secs: default_refresh_secs(),
            index_ttl_secs: default_index_ttl_secs(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            protected_branches: default_protected_branches(),
            require_clean_branch: false,
            dangerous_commands: default_dangerous_commands(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            agent_type: default_agent_type(),
            source: default_source(),
            channels: ChannelConfig::default(),
            timing: TimingConfig::default(),
            lease: LeaseConfig::default(),
            server: ServerConfig::default(),
            safety: SafetyConfig::default(),
            redis: RedisSection::default(),
        }
    }
}

impl BeaconConfig {
    /// Parse and validate a TOML document
    ///
    /// The primary and control channels follow `agent_type` unless the
    /// document names them explicitly.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let document: toml::Table = toml::from_str(content)?;
        let explicit = |name: &str| {
            document
                .get("channels")
                .and_then(|c| c.get(name))
                .is_some()
        };
        let (primary_set, control_set) = (explicit("primary"), explicit("control"));

        let mut config: BeaconConfig = toml::Value::Table(document).try_into()?;
        if !primary_set {
            config.channels.primary = primary_channel_for(&config.agent_type);
        }
        if !control_set {
            config.channels.control = control_channel_for(&config.agent_type);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    /// Returns the default config if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            BeaconError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings that would break lease or debounce invariants
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(BeaconError::Config("key_prefix must not be empty".to_string()));
        }
        if self.timing.debounce_ms == 0 {
            return Err(BeaconError::Config("timing.debounce_ms must be > 0".to_string()));
        }
        if self.timing.heartbeat_secs == 0 {
            return Err(BeaconError::Config("timing.heartbeat_secs must be > 0".to_string()));
        }
        if self.lease.refresh_secs == 0 || self.lease.refresh_secs >= self.lease.ttl_secs {
            return Err(BeaconError::Config(format!(
                "lease.refresh_secs ({}) must be non-zero and shorter than lease.ttl_secs ({})",
                self.lease.refresh_secs, self.lease.ttl_secs
            )));
        }
        Ok(())
    }
}
