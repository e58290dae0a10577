//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.duet/config.json`) and environment.
//! Every section has defaults, so an empty `{}` file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// The two personas and which one answers first.
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Batching, autonomous dialogue and dialogue bounds for responding channels.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Batching for collector channels (aggregate and remember, never reply).
    #[serde(default)]
    pub collector: CollectorConfig,

    /// In-process memory store limits.
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
    /// Chats the bot listens to. Empty means every chat is a responding channel.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// One allowed chat and what the agent does with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub id: String,
    #[serde(default)]
    pub role: ChannelRole,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Batches are answered by the personas; autonomous dialogue runs here.
    #[default]
    Respond,
    /// Batches are only aggregated and remembered.
    Collect,
}

impl TelegramChannelConfig {
    /// Role for a chat id, or None when the chat is not allowed.
    pub fn role_for(&self, chat_id: &str) -> Option<ChannelRole> {
        if self.groups.is_empty() {
            return Some(ChannelRole::Respond);
        }
        self.groups
            .iter()
            .find(|g| g.id.trim() == chat_id)
            .map(|g| g.role)
    }

    /// True only for chats listed in `groups` with the `respond` role.
    pub fn is_listed_respond(&self, chat_id: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.id.trim() == chat_id && g.role == ChannelRole::Respond)
    }
}

/// LLM provider behind a persona.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama (`/api/chat`).
    #[default]
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint (OpenAI, Groq, LM Studio, ...).
    Openai,
}

/// One persona: model backend plus its instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    /// Display name. Together with provider, model, base URL and temperature it keys the shared client.
    pub name: String,
    #[serde(default)]
    pub provider: ProviderKind,
    /// Model id passed as-is to the backend. Empty uses the provider fallback.
    #[serde(default)]
    pub model: Option<String>,
    /// Override the provider base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key (openai provider only).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: String,
    /// User-side prompt sent on turns after the first.
    #[serde(default = "default_follow_up")]
    pub follow_up: String,
}

fn default_follow_up() -> String {
    "respond to the previous thought from your own perspective.".to_string()
}

impl PersonaConfig {
    fn named(name: &str, temperature: f32, system_prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: ProviderKind::Ollama,
            model: None,
            base_url: None,
            api_key_env: None,
            temperature: Some(temperature),
            system_prompt: system_prompt.to_string(),
            follow_up: default_follow_up(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonasConfig {
    pub a: PersonaConfig,
    pub b: PersonaConfig,
}

impl Default for PersonasConfig {
    fn default() -> Self {
        Self {
            a: PersonaConfig::named(
                "analytical",
                0.3,
                "You are the analytical voice of the group. Be brief, precise and informal.",
            ),
            b: PersonaConfig::named(
                "creative",
                0.7,
                "You are the creative voice of the group. Be brief, associative and informal.",
            ),
        }
    }
}

/// Which persona slot a config value refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaSlot {
    #[default]
    A,
    B,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub personas: PersonasConfig,
    /// Persona that answers a batch first; the other one answers last.
    #[serde(default)]
    pub first_responder: PersonaSlot,
}

/// How a flushed batch is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Both personas answer once each.
    #[default]
    Dialogue,
    /// Only the first responder answers, with a single generation.
    Direct,
}

/// Scheduler settings for responding channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub tick_millis: u64,
    /// Accumulated characters that force a flush. None disables the trigger.
    pub char_threshold: Option<usize>,
    /// Seconds since the last flush that force a flush.
    pub max_wait_secs: u64,
    /// Pending message count that forces a flush. None disables the trigger.
    pub count_threshold: Option<usize>,
    /// Pending messages kept before the oldest is evicted.
    pub max_pending: usize,
    /// Seconds between autonomous dialogue runs. 0 disables autonomous dialogue.
    /// Only chats listed in `channels.telegram.groups` as `respond` (and the console) run it.
    pub autonomous_interval_secs: u64,
    pub autonomous_failure_cooldown_secs: u64,
    pub max_dialogue_depth: usize,
    /// Utterances of history included in each generation request.
    pub history_window: usize,
    pub generation_timeout_secs: u64,
    pub jitter_min_millis: u64,
    pub jitter_max_millis: u64,
    pub error_backoff_secs: u64,
    pub reply_mode: ReplyMode,
    /// Memory entries recalled as context for a reactive run. 0 disables recall.
    pub recall_top_k: usize,
    /// Sent to the channel when a batch produced no reply. Unset = stay silent.
    pub failure_notice: Option<String>,
    /// Seed topics for autonomous dialogue.
    pub topics: Vec<String>,
    /// Seconds without new messages after which a chat's scheduler is stopped. 0 keeps schedulers forever.
    pub idle_reap_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            char_threshold: Some(2000),
            max_wait_secs: 5,
            count_threshold: Some(5),
            max_pending: 10,
            autonomous_interval_secs: 180,
            autonomous_failure_cooldown_secs: 30,
            max_dialogue_depth: 3,
            history_window: 3,
            generation_timeout_secs: 60,
            jitter_min_millis: 2000,
            jitter_max_millis: 5000,
            error_backoff_secs: 5,
            reply_mode: ReplyMode::Dialogue,
            recall_top_k: 3,
            failure_notice: None,
            topics: default_topics(),
            idle_reap_secs: 1800,
        }
    }
}

fn default_topics() -> Vec<String> {
    [
        "what a group remembers that no single member does",
        "how conversations drift and come back",
        "the difference between noticing a pattern and inventing one",
        "why some questions are better left open",
        "the rhythm of a chat that goes quiet",
        "agreement that arrives too quickly",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// None when autonomous dialogue is disabled.
    pub fn autonomous_interval(&self) -> Option<Duration> {
        (self.autonomous_interval_secs > 0).then(|| Duration::from_secs(self.autonomous_interval_secs))
    }

    /// None when idle schedulers are kept.
    pub fn idle_reap(&self) -> Option<Duration> {
        (self.idle_reap_secs > 0).then(|| Duration::from_secs(self.idle_reap_secs))
    }

    pub fn autonomous_failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.autonomous_failure_cooldown_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs.max(1))
    }

    /// Jitter bounds with min <= max.
    pub fn jitter_range(&self) -> (Duration, Duration) {
        let lo = self.jitter_min_millis.min(self.jitter_max_millis);
        let hi = self.jitter_min_millis.max(self.jitter_max_millis);
        (Duration::from_millis(lo), Duration::from_millis(hi))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// Batching for collector channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectorConfig {
    pub char_threshold: Option<usize>,
    pub max_wait_secs: u64,
    pub max_pending: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            char_threshold: Some(2000),
            max_wait_secs: 30 * 60,
            max_pending: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    pub max_entries: usize,
    /// Entries older than this are dropped on insert. 0 keeps entries forever.
    pub retention_hours: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            retention_hours: 24,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    non_empty_env("TELEGRAM_BOT_TOKEN").or_else(|| {
        config
            .channels
            .telegram
            .bot_token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve a persona's API key from the environment variable it names.
pub fn resolve_api_key(persona: &PersonaConfig) -> Option<String> {
    persona.api_key_env.as_deref().and_then(non_empty_env)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DUET_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".duet").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or DUET_CONFIG_PATH). Missing file => default config.
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
