//! Configuration loading and validation.
//!
//! Sealpost reads a human-owned `config.toml` from its runtime root
//! (`~/.sealpost/` unless `SEALPOST_HOME` or `--home` says otherwise).
//! Secrets live separately in `.env`, see [`crate::credentials`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::codec::DEFAULT_HEADER;
use crate::dispatch::DispatchSettings;
use crate::ring;
use crate::target::{ResolverThresholds, DEFAULT_THREAD_ID_MIN_DIGITS, DEFAULT_USER_ID_MIN_DIGITS};
use crate::vault::DEFAULT_LABEL;

/// Environment variable overriding the runtime root.
pub const HOME_ENV: &str = "SEALPOST_HOME";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Recipient.
    #[serde(default)]
    pub target: TargetConfig,

    /// Message source.
    #[serde(default)]
    pub messages: MessagesConfig,

    /// Send interval, backoff, and timeouts.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Target classification thresholds.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Graph API endpoint settings.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Key selection.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Outer message body framing.
    #[serde(default)]
    pub framing: FramingConfig,
}

/// Recipient configuration.
#[derive(Debug, Default, Deserialize)]
pub struct TargetConfig {
    /// Raw identifier: numeric id, thread URL, or profile URL.
    #[serde(default)]
    pub raw: String,
}

/// Message source configuration.
#[derive(Debug, Deserialize)]
pub struct MessagesConfig {
    /// Message file, one message per line. Relative paths resolve against
    /// the runtime root.
    #[serde(default = "default_messages_file")]
    pub file: PathBuf,

    /// Inline messages. Take precedence over `file` when non-empty.
    #[serde(default)]
    pub items: Vec<String>,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            file: default_messages_file(),
            items: Vec::new(),
        }
    }
}

/// Dispatch timing.
#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between successful sends.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds to wait after a failed send before retrying.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Stop-request polling granularity in milliseconds.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    /// Per-delivery timeout in seconds.
    #[serde(default = "default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,

    /// Per-lookup timeout in seconds.
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,

    /// Seconds between `status.json` refreshes.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            backoff_secs: default_backoff_secs(),
            tick_millis: default_tick_millis(),
            transport_timeout_secs: default_transport_timeout_secs(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

/// Digit thresholds for bare numeric targets.
#[derive(Debug, Deserialize)]
pub struct ResolverConfig {
    /// Minimum digits for a thread id.
    #[serde(default = "default_thread_id_min_digits")]
    pub thread_id_min_digits: usize,

    /// Minimum digits for a user id.
    #[serde(default = "default_user_id_min_digits")]
    pub user_id_min_digits: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            thread_id_min_digits: default_thread_id_min_digits(),
            user_id_min_digits: default_user_id_min_digits(),
        }
    }
}

/// Graph API endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    /// Base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// `messaging_type` sent with each message.
    #[serde(default = "default_messaging_type")]
    pub messaging_type: String,

    /// Message tag. Empty disables the field.
    #[serde(default = "default_tag")]
    pub tag: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_version: default_api_version(),
            messaging_type: default_messaging_type(),
            tag: default_tag(),
        }
    }
}

/// Key selection.
#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    /// Credential label naming the key/salt pair.
    #[serde(default = "default_vault_label")]
    pub label: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            label: default_vault_label(),
        }
    }
}

/// Outer body framing.
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    /// Banner line above the envelope.
    #[serde(default = "default_header")]
    pub header: String,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            header: default_header(),
        }
    }
}

// Default value functions for serde

fn default_messages_file() -> PathBuf {
    PathBuf::from("messages.txt")
}
fn default_interval_secs() -> u64 {
    120
}
fn default_backoff_secs() -> u64 {
    60
}
fn default_tick_millis() -> u64 {
    1000
}
fn default_transport_timeout_secs() -> u64 {
    30
}
fn default_lookup_timeout_secs() -> u64 {
    10
}
fn default_status_interval_secs() -> u64 {
    15
}
fn default_thread_id_min_digits() -> usize {
    DEFAULT_THREAD_ID_MIN_DIGITS
}
fn default_user_id_min_digits() -> usize {
    DEFAULT_USER_ID_MIN_DIGITS
}
fn default_api_base() -> String {
    "https://graph.facebook.com".to_owned()
}
fn default_api_version() -> String {
    "v18.0".to_owned()
}
fn default_messaging_type() -> String {
    "MESSAGE_TAG".to_owned()
}
fn default_tag() -> String {
    "CONFIRMED_EVENT_UPDATE".to_owned()
}
fn default_vault_label() -> String {
    DEFAULT_LABEL.to_owned()
}
fn default_header() -> String {
    DEFAULT_HEADER.to_owned()
}

impl Config {
    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment overrides. `env` is injected for testability.
    ///
    /// Recognised keys: `SEALPOST_TARGET`, `SEALPOST_INTERVAL_SECS`,
    /// `SEALPOST_BACKOFF_SECS`. Unparseable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("SEALPOST_TARGET").filter(|v| !v.trim().is_empty()) {
            self.target.raw = v;
        }
        if let Some(v) = env("SEALPOST_INTERVAL_SECS").and_then(|v| v.trim().parse().ok()) {
            self.schedule.interval_secs = v;
        }
        if let Some(v) = env("SEALPOST_BACKOFF_SECS").and_then(|v| v.trim().parse().ok()) {
            self.schedule.backoff_secs = v;
        }
    }

    /// Check the invariants the dispatch engine relies on.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target.raw.trim().is_empty() {
            anyhow::bail!("[target] raw must not be empty");
        }
        if self.schedule.interval_secs == 0 {
            anyhow::bail!("[schedule] interval_secs must be positive");
        }
        if self.schedule.backoff_secs == 0 {
            anyhow::bail!("[schedule] backoff_secs must be positive");
        }
        if self.schedule.tick_millis == 0 {
            anyhow::bail!("[schedule] tick_millis must be positive");
        }
        if self.schedule.transport_timeout_secs == 0 || self.schedule.lookup_timeout_secs == 0 {
            anyhow::bail!("[schedule] timeouts must be positive");
        }
        if self.resolver.user_id_min_digits == 0
            || self.resolver.user_id_min_digits >= self.resolver.thread_id_min_digits
        {
            anyhow::bail!(
                "[resolver] user_id_min_digits ({}) must be positive and below thread_id_min_digits ({})",
                self.resolver.user_id_min_digits,
                self.resolver.thread_id_min_digits
            );
        }
        Ok(())
    }

    /// Classification thresholds.
    pub fn thresholds(&self) -> ResolverThresholds {
        ResolverThresholds {
            thread_id_min_digits: self.resolver.thread_id_min_digits,
            user_id_min_digits: self.resolver.user_id_min_digits,
        }
    }

    /// Identity lookup timeout.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule.lookup_timeout_secs)
    }

    /// Status file refresh interval.
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.status_interval_secs)
    }

    /// Timing and framing for the dispatch loop.
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            interval: Duration::from_secs(self.schedule.interval_secs),
            backoff: Duration::from_secs(self.schedule.backoff_secs),
            tick: Duration::from_millis(self.schedule.tick_millis),
            transport_timeout: Duration::from_secs(self.schedule.transport_timeout_secs),
            header: self.framing.header.clone(),
        }
    }

    /// Messages to rotate: inline items when present, else the message file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or yields no messages.
    pub fn message_items(&self, root: &Path) -> anyhow::Result<Vec<String>> {
        let inline: Vec<String> = self
            .messages
            .items
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(str::to_owned)
            .collect();
        if !inline.is_empty() {
            return Ok(inline);
        }

        let path = self.messages_path(root);
        ring::load_messages(&path)
            .with_context(|| format!("no messages available from {}", path.display()))
    }

    /// Absolute path of the message file.
    pub fn messages_path(&self, root: &Path) -> PathBuf {
        if self.messages.file.is_absolute() {
            self.messages.file.clone()
        } else {
            root.join(&self.messages.file)
        }
    }
}

/// Load config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load config if the file exists, defaults otherwise.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read or parsed.
pub fn load_config_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Resolved filesystem layout under the runtime root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Runtime root.
    pub root: PathBuf,
    /// `config.toml`.
    pub config_toml: PathBuf,
    /// `.env` credentials.
    pub env_file: PathBuf,
    /// Key and salt artifacts.
    pub keys_dir: PathBuf,
    /// Diagnostic logs.
    pub logs_dir: PathBuf,
    /// Human-readable audit lines.
    pub audit_log: PathBuf,
    /// Structured audit records.
    pub audit_jsonl: PathBuf,
    /// Dispatch status snapshot.
    pub status_json: PathBuf,
}

impl RuntimePaths {
    /// Lay out paths under `root`.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_toml: root.join("config.toml"),
            env_file: root.join(".env"),
            keys_dir: root.join("keys"),
            logs_dir: root.join("logs"),
            audit_log: root.join("audit.log"),
            audit_jsonl: root.join("audit.jsonl"),
            status_json: root.join("status.json"),
            root,
        }
    }
}

/// Resolve runtime paths: explicit override, then `SEALPOST_HOME`, then
/// `~/.sealpost`.
///
/// # Errors
///
/// Returns an error if no override is given and the home directory cannot be
/// determined.
pub fn runtime_paths(home_override: Option<&Path>) -> anyhow::Result<RuntimePaths> {
    runtime_paths_with(home_override, |key| std::env::var(key).ok())
}

/// [`runtime_paths`] with an injected environment lookup.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths_with<F>(home_override: Option<&Path>, env: F) -> anyhow::Result<RuntimePaths>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(root) = home_override {
        return Ok(RuntimePaths::from_root(root));
    }
    if let Some(root) = env(HOME_ENV).filter(|v| !v.trim().is_empty()) {
        return Ok(RuntimePaths::from_root(root));
    }
    Ok(RuntimePaths::from_root(config_dir()?))
}

/// Resolve the default runtime root (`~/.sealpost/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".sealpost"))
}
