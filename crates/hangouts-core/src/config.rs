//! Hangouts configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HangoutsError, Result};

/// Upper bound on how long the alarm loop may sleep between registry checks.
pub const MAX_POLL_INTERVAL_SECS: u64 = 60;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HangoutsConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
}

impl HangoutsConfig {
    /// Load config from the default path (~/.hangouts/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HangoutsError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| HangoutsError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Hangouts home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hangouts")
    }

    /// Fill credentials from the environment where the file left them empty.
    pub fn apply_env(&mut self) {
        if self.llm.api_key.is_empty()
            && let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.llm.api_key = key;
            }
        if self.discord.bot_token.is_empty()
            && let Ok(token) = std::env::var("DISCORD_TOKEN") {
                self.discord.bot_token = token;
            }
        if self.discord.user_id.is_empty()
            && let Ok(user_id) = std::env::var("DISCORD_USER_ID") {
                self.discord.user_id = user_id;
            }
    }

    /// Check everything that must hold before any task is started.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.trim().is_empty() {
            return Err(HangoutsError::Config(
                "model provider credential is not set (llm.api_key or OPENAI_API_KEY)".into(),
            ));
        }
        if self.discord.enabled && self.discord.bot_token.trim().is_empty() {
            return Err(HangoutsError::Config(
                "Discord is enabled but no bot token was given (--discord-token, discord.bot_token or DISCORD_TOKEN)".into(),
            ));
        }
        if self.discord.enabled {
            let user_id = self.discord.user_id.trim();
            if user_id.is_empty() || !user_id.chars().all(|c| c.is_ascii_digit()) {
                return Err(HangoutsError::Config(
                    "discord.user_id must be a numeric Discord user id (--discord-user or DISCORD_USER_ID)"
                        .into(),
                ));
            }
        }
        if self.processor.max_attempts == 0 {
            return Err(HangoutsError::Config("processor.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Conversational engine (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_endpoint() -> String { "https://api.openai.com/v1".into() }
fn default_model() -> String { "gpt-4o-mini".into() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 256 }
fn default_timeout_secs() -> u64 { 30 }
fn default_system_prompt() -> String {
    "You are Hangouts, a friendly assistant that keeps people on schedule. \
     Answer briefly and warmly."
        .into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Alarm scheduling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub max_poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 { MAX_POLL_INTERVAL_SECS }

impl SchedulerConfig {
    /// Poll interval, clamped to `1..=MAX_POLL_INTERVAL_SECS`.
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_secs.clamp(1, MAX_POLL_INTERVAL_SECS))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_poll_interval_secs: default_poll_interval() }
    }
}

/// Alarm event processor retry policy and context loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 8_000 }
fn default_history_limit() -> usize { 20 }

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            history_limit: default_history_limit(),
        }
    }
}

/// Persistence backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// "sqlite" or "memory".
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_backend() -> String { "sqlite".into() }
fn default_db_path() -> String { "~/.hangouts/hangouts.db".into() }

impl DatabaseConfig {
    /// Database path with `~` and env vars expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { backend: default_backend(), path: default_db_path() }
    }
}

/// Discord delivery. When enabled, reminders go out as DMs instead of to the console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Discord user id that owns console-scheduled reminders.
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_discord_api")]
    pub api_base: String,
    /// Per-request timeout for the REST API.
    #[serde(default = "default_discord_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_discord_api() -> String { "https://discord.com/api/v10".into() }
fn default_discord_timeout_secs() -> u64 { 10 }

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            user_id: String::new(),
            api_base: default_discord_api(),
            timeout_secs: default_discord_timeout_secs(),
        }
    }
}

/// What the supervisor does when a task fails unexpectedly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel all sibling tasks and shut down.
    #[default]
    ShutdownAll,
    /// Log the failure and keep the remaining tasks running.
    Isolate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Inbound message validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_validator_tokens")]
    pub max_tokens: usize,
}

fn default_validator_tokens() -> usize { 50 }

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { max_tokens: default_validator_tokens() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HangoutsConfig::default();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.database.backend, "sqlite");
        assert_eq!(config.processor.max_attempts, 3);
        assert_eq!(config.supervisor.failure_policy, FailurePolicy::ShutdownAll);
        assert!(!config.discord.enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [llm]
            api_key = "sk-test"
            model = "gpt-4o"

            [scheduler]
            max_poll_interval_secs = 10

            [discord]
            enabled = true
            bot_token = "abc"

            [supervisor]
            failure_policy = "isolate"
        "#;

        let config: HangoutsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.scheduler.max_poll_interval(), Duration::from_secs(10));
        assert_eq!(config.supervisor.failure_policy, FailurePolicy::Isolate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: HangoutsConfig = toml::from_str("").unwrap();
        assert_eq!(config.processor.base_backoff_ms, 500);
        assert_eq!(config.validator.max_tokens, 50);
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let cfg = SchedulerConfig { max_poll_interval_secs: 3600 };
        assert_eq!(cfg.max_poll_interval(), Duration::from_secs(MAX_POLL_INTERVAL_SECS));
        let cfg = SchedulerConfig { max_poll_interval_secs: 0 };
        assert_eq!(cfg.max_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let config = HangoutsConfig::default();
        assert!(matches!(config.validate(), Err(HangoutsError::Config(_))));
    }

    #[test]
    fn test_discord_requires_token() {
        let mut config = HangoutsConfig::default();
        config.llm.api_key = "sk-test".into();
        config.discord.enabled = true;
        assert!(matches!(config.validate(), Err(HangoutsError::Config(_))));
        config.discord.bot_token = "token".into();
        assert!(matches!(config.validate(), Err(HangoutsError::Config(_))));
        config.discord.user_id = "console".into();
        assert!(matches!(config.validate(), Err(HangoutsError::Config(_))));
        config.discord.user_id = "123456789012345678".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discord_defaults() {
        let config: HangoutsConfig = toml::from_str("[discord]\nenabled = true\n").unwrap();
        assert_eq!(config.discord.api_base, "https://discord.com/api/v10");
        assert_eq!(config.discord.timeout_secs, 10);
        assert!(config.discord.user_id.is_empty());
    }

    #[test]
    fn test_home_dir() {
        let home = HangoutsConfig::home_dir();
        assert!(home.to_string_lossy().contains("hangouts"));
    }
}
