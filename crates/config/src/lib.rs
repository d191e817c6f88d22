//! Configuration loading, validation, and management for murmur.
//!
//! Loads configuration from `~/.murmur/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.murmur/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Where the SQLite database lives (default: ~/.murmur/data)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub chat: ChatConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("data_dir", &self.data_dir)
            .field("provider", &self.provider)
            .field("context", &self.context)
            .field("orchestrator", &self.orchestrator)
            .field("sessions", &self.sessions)
            .field("scheduler", &self.scheduler)
            .field("memory", &self.memory)
            .field("chat", &self.chat)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: u32,

    /// Deadline for one model call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_completion_tokens() -> u32 {
    1024
}
fn default_timeout_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_completion_tokens: default_max_completion_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget of one conversation's window
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Messages older than this are trimmed
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: u64,

    /// Standing instructions kept at the head of every window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Per-cycle instructions. `{weekday}` and `{datetime}` are filled in
    /// every cycle.
    #[serde(default = "default_developer_prompt")]
    pub developer_prompt: String,
}

fn default_token_budget() -> usize {
    24_576
}
fn default_max_age_minutes() -> u64 {
    120
}
fn default_developer_prompt() -> String {
    "You are {name}, an assistant taking part in a group chat. \
     Messages from participants are prefixed with [message id] name (user id). \
     Answer concisely and in the language of the person addressing you. \
     Use the tools when they help: calculator for arithmetic, schedule_task for \
     reminders, update_user_profile to remember lasting facts about a user. \
     Current date: {weekday} {datetime}."
        .into()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            max_age_minutes: default_max_age_minutes(),
            system_prompt: None,
            developer_prompt: default_developer_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum tool-call rounds per completion cycle
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Retry once with a nudge when the model answers with nothing
    #[serde(default = "default_true")]
    pub empty_reply_retry: bool,
}

fn default_max_tool_rounds() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            empty_reply_retry: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions idle longer than this are evicted
    #[serde(default = "default_max_idle_minutes")]
    pub max_idle_minutes: u64,

    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// A conversation's dispatch lane exits after this much inactivity
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
}

fn default_max_idle_minutes() -> u64 {
    360
}
fn default_eviction_interval_secs() -> u64 {
    300
}
fn default_lane_idle_secs() -> u64 {
    600
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_idle_minutes: default_max_idle_minutes(),
            eviction_interval_secs: default_eviction_interval_secs(),
            lane_idle_secs: default_lane_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tasks one completion cycle may schedule
    #[serde(default = "default_chain_cap")]
    pub chain_cap: u32,

    #[serde(default = "default_max_pending_per_user")]
    pub max_pending_per_user: usize,

    #[serde(default = "default_min_delay_minutes")]
    pub min_delay_minutes: i64,

    #[serde(default = "default_max_delay_minutes")]
    pub max_delay_minutes: i64,

    /// Fired and cancelled tasks are purged after this many days
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Pause after a storage failure in the scheduling loop
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_chain_cap() -> u32 {
    5
}
fn default_max_pending_per_user() -> usize {
    10
}
fn default_min_delay_minutes() -> i64 {
    2
}
fn default_max_delay_minutes() -> i64 {
    43_200
}
fn default_retention_days() -> i64 {
    1
}
fn default_retry_backoff_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chain_cap: default_chain_cap(),
            max_pending_per_user: default_max_pending_per_user(),
            min_delay_minutes: default_min_delay_minutes(),
            max_delay_minutes: default_max_delay_minutes(),
            retention_days: default_retention_days(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// Re-extract a user's facts from their recent messages once their
    /// profile goes stale
    #[serde(default = "default_true")]
    pub auto_refresh: bool,

    /// Model used for fact extraction; defaults to `provider.model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_model: Option<String>,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            auto_refresh: true,
            refresh_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// "off", "strict" or "greedy"
    #[serde(default = "default_chat_mode")]
    pub mode: String,

    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
}

fn default_chat_mode() -> String {
    "strict".into()
}
fn default_assistant_name() -> String {
    "murmur".into()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            mode: default_chat_mode(),
            assistant_name: default_assistant_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.murmur/config.toml).
    ///
    /// Environment overrides:
    /// - `MURMUR_API_KEY`, then `OPENAI_API_KEY`, when no key is configured
    /// - `MURMUR_MODEL`
    /// - `MURMUR_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("MURMUR_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("MURMUR_MODEL") {
            config.provider.model = model;
        }

        if let Ok(url) = std::env::var("MURMUR_BASE_URL") {
            config.provider.base_url = url;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".murmur")
    }

    /// Directory holding the database.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Path of the SQLite database shared by profiles and tasks.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("murmur.db")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.provider.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "provider.timeout_secs must be > 0".into(),
            ));
        }

        if self.context.token_budget == 0 {
            return Err(ConfigError::ValidationError(
                "context.token_budget must be > 0".into(),
            ));
        }

        if !(1..=9).contains(&self.orchestrator.max_tool_rounds) {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_tool_rounds must be between 1 and 9".into(),
            ));
        }

        let s = &self.scheduler;
        if s.min_delay_minutes < 1 || s.min_delay_minutes > s.max_delay_minutes {
            return Err(ConfigError::ValidationError(
                "scheduler delays must satisfy 1 <= min_delay_minutes <= max_delay_minutes".into(),
            ));
        }

        if !matches!(self.memory.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "memory.backend must be \"sqlite\" or \"memory\", got \"{}\"",
                self.memory.backend
            )));
        }

        if !matches!(self.chat.mode.as_str(), "off" | "strict" | "greedy") {
            return Err(ConfigError::ValidationError(format!(
                "chat.mode must be off, strict or greedy, got \"{}\"",
                self.chat.mode
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            data_dir: None,
            provider: ProviderConfig::default(),
            context: ContextConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            sessions: SessionsConfig::default(),
            scheduler: SchedulerConfig::default(),
            memory: MemoryConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
