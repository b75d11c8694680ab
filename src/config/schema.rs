use crate::channels::base::GroupPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_bus_capacity() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default = "default_bus_capacity", rename = "busCapacity")]
    pub bus_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channels: ChannelsConfig::default(),
            llm: LlmConfig::default(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub cli: CliConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Override the Bot API base URL (self-hosted bot API servers).
    #[serde(default, rename = "baseUrl")]
    pub base_url: String,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
    #[serde(default, rename = "groupPolicy")]
    pub group_policy: GroupPolicy,
    #[serde(default, rename = "groupAllowFrom")]
    pub group_allow_from: Vec<String>,
    /// Long-poll timeout in seconds, clamped to 1–50 (default 25).
    #[serde(default, rename = "pollTimeoutSec")]
    pub poll_timeout_sec: i64,
    /// Update worker pool size, clamped to 1–8 (default 2).
    #[serde(default)]
    pub workers: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "botToken")]
    pub bot_token: String,
    #[serde(default, rename = "appToken")]
    pub app_token: String,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
    #[serde(default, rename = "groupPolicy")]
    pub group_policy: GroupPolicy,
    #[serde(default, rename = "groupAllowFrom")]
    pub group_allow_from: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Gateway intent bits. Zero selects the default message intents.
    #[serde(default)]
    pub intents: u64,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
    #[serde(default, rename = "groupPolicy")]
    pub group_policy: GroupPolicy,
    #[serde(default, rename = "groupAllowFrom")]
    pub group_allow_from: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "accessToken")]
    pub access_token: String,
    #[serde(default, rename = "phoneNumberId")]
    pub phone_number_id: String,
    #[serde(default, rename = "verifyToken")]
    pub verify_token: String,
    /// App secret for webhook signature verification. Empty accepts
    /// unsigned webhooks.
    #[serde(default, rename = "appSecret")]
    pub app_secret: String,
    #[serde(default, rename = "baseUrl")]
    pub base_url: String,
    #[serde(default, rename = "apiVersion")]
    pub api_version: String,
    #[serde(default, rename = "webhookPath")]
    pub webhook_path: String,
    #[serde(default, rename = "webhookListen")]
    pub webhook_listen: String,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider dialect: openai/openrouter/ollama/local (OpenAI-compatible),
    /// anthropic, gemini, antigravity. Empty means OpenAI-compatible.
    #[serde(default)]
    pub provider: String,
    #[serde(default, rename = "baseUrl")]
    pub base_url: String,
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "maxTokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Minimum start-to-start spacing between requests, in seconds.
    /// Zero selects the 1 s default.
    #[serde(default, rename = "cooldownSec")]
    pub cooldown_sec: f64,
    #[serde(default, rename = "systemPrompt")]
    pub system_prompt: String,
    /// Retries after the first attempt on rate limits and timeouts.
    /// Zero selects the default of 3.
    #[serde(default, rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub verbose: bool,
    /// Model ids reported for the Antigravity provider, which has no
    /// listing API.
    #[serde(default = "default_antigravity_models", rename = "antigravityModels")]
    pub antigravity_models: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            max_tokens: 0,
            temperature: None,
            cooldown_sec: 0.0,
            system_prompt: String::new(),
            max_retries: 0,
            headers: HashMap::new(),
            verbose: false,
            antigravity_models: default_antigravity_models(),
        }
    }
}

pub(crate) fn default_antigravity_models() -> Vec<String> {
    [
        "gemini-2.5-flash",
        "gemini-2.5-pro",
        "gemini-3-flash-preview",
        "gemini-3-pro-preview",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
