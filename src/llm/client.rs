use crate::config::LlmConfig;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_TEMPERATURE: f64 = 0.7;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool offered to the model. `parameters` is a JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One chat message in provider-neutral shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::default()
        }
    }
}

/// Outcome of one chat turn: either text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

pub(crate) struct Pacing {
    last_request_at: Option<Instant>,
}

/// Rate-limited, retry-capable chat client against one of several
/// provider dialects.
///
/// All requests on one instance are serialized through an internal
/// mutex: free-tier providers enforce strict concurrency limits, and the
/// retry budget is only meaningful against a known-quiescent peer.
/// Parallel LLM work is obtained by instantiating additional clients.
pub struct Client {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Minimum start-to-start spacing between requests. Zero selects the
    /// 1 s default.
    pub cooldown: Duration,
    pub system_prompt: String,
    pub max_retries: u32,
    pub headers: HashMap<String, String>,
    pub verbose: bool,
    pub antigravity_models: Vec<String>,
    http: reqwest::Client,
    pacing: Mutex<Pacing>,
}

impl Client {
    pub fn new(cfg: &LlmConfig) -> Self {
        Self::with_http_timeout(cfg, DEFAULT_HTTP_TIMEOUT)
    }

    fn with_http_timeout(cfg: &LlmConfig, timeout: Duration) -> Self {
        Self {
            provider: cfg.provider.clone(),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            cooldown: if cfg.cooldown_sec > 0.0 {
                Duration::from_secs_f64(cfg.cooldown_sec)
            } else {
                Duration::ZERO
            },
            system_prompt: cfg.system_prompt.clone(),
            max_retries: cfg.max_retries,
            headers: cfg.headers.clone(),
            verbose: cfg.verbose,
            antigravity_models: cfg.antigravity_models.clone(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            pacing: Mutex::new(Pacing {
                last_request_at: None,
            }),
        }
    }

    /// A single-shot clone targeting `model`, used for probing: short
    /// timeout, quiet, and callers go straight to `dispatch` (no retry).
    pub(crate) fn probe_clone(&self, model: &str) -> Self {
        Self {
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: model.to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            cooldown: self.cooldown,
            system_prompt: String::new(),
            max_retries: 0,
            headers: self.headers.clone(),
            verbose: false,
            antigravity_models: self.antigravity_models.clone(),
            http: reqwest::Client::builder()
                .timeout(PROBE_HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            pacing: Mutex::new(Pacing {
                last_request_at: None,
            }),
        }
    }

    /// Perform one chat turn.
    ///
    /// Holds the client mutex for the full duration, enforces the
    /// start-to-start cooldown, prepends the configured system prompt,
    /// and retries rate limits and timeouts per the wait policy. The
    /// caller's message slice is never mutated.
    pub async fn chat(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<ChatResult> {
        let mut pacing = self.pacing.lock().await;

        let cooldown = if self.cooldown.is_zero() {
            DEFAULT_COOLDOWN
        } else {
            self.cooldown
        };
        if let Some(last) = pacing.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < cooldown {
                let wait = cooldown - elapsed;
                if self.verbose {
                    debug!("llm: cooling down for {:?}", wait);
                }
                tokio::time::sleep(wait).await;
            }
        }
        // Cooldown measures start-to-start spacing: a slow response
        // absorbs part of the next request's pacing budget.
        pacing.last_request_at = Some(Instant::now());

        let started = Instant::now();
        if self.verbose {
            debug!(
                "llm: request started provider={} model={}",
                self.provider, self.model
            );
        }

        let messages = self.with_system_prompt(messages);
        let max_retries = if self.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.max_retries
        };

        let mut attempt: u32 = 0;
        let result = loop {
            match self.dispatch(&messages, tools).await {
                Ok(res) => break Ok(res),
                Err(err) => {
                    let text = err.to_string().to_lowercase();
                    let is_rate_limit = text.contains("429")
                        || text.contains("rate limit")
                        || text.contains("resource_exhausted");
                    let is_timeout =
                        text.contains("timeout") || text.contains("deadline exceeded");
                    if (is_rate_limit || is_timeout) && attempt < max_retries {
                        let wait = retry_wait(&text, attempt);
                        let label = if is_timeout { "timeout" } else { "rate limit" };
                        eprintln!(
                            "warning: llm {} detected, retrying in {:?} (attempt {}/{})...",
                            label,
                            wait,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(err);
                }
            }
        };

        if self.verbose {
            match &result {
                Ok(_) => debug!("llm: request succeeded after {:?}", started.elapsed()),
                Err(err) => debug!(
                    "llm: request failed after {:?}: {}",
                    started.elapsed(),
                    err
                ),
            }
        }
        result
    }

    /// Route one request to the provider dialect, without pacing or
    /// retries.
    pub(crate) async fn dispatch(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatResult> {
        match normalize_provider(&self.provider).as_str() {
            "" | "openai" | "openrouter" | "ollama" => {
                crate::llm::openai::chat(self, messages, tools).await
            }
            "anthropic" => crate::llm::anthropic::chat(self, messages, tools).await,
            "gemini" => crate::llm::gemini::chat(self, messages, tools).await,
            "antigravity" => crate::llm::antigravity::chat(self, messages, tools).await,
            _ => Err(crate::errors::PincerError::Provider(format!(
                "unsupported llm provider: {}",
                self.provider.trim()
            ))
            .into()),
        }
    }

    fn with_system_prompt(&self, messages: &[Message]) -> Vec<Message> {
        let prompt = self.system_prompt.trim();
        if prompt.is_empty() {
            return messages.to_vec();
        }
        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(Message::system(prompt));
        out.extend_from_slice(messages);
        out
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Take the client's request lock without touching pacing state.
    /// Model listing and probing serialize behind the same mutex as chat.
    pub(crate) async fn serialize_requests(&self) -> tokio::sync::MutexGuard<'_, Pacing> {
        self.pacing.lock().await
    }

    /// Bearer auth from the api key, then configured headers on top
    /// (which can override the authorization).
    pub(crate) fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(self.api_key.trim());
        }
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        req
    }

    pub(crate) fn max_tokens_value(&self) -> u32 {
        if self.max_tokens == 0 {
            DEFAULT_MAX_TOKENS
        } else {
            self.max_tokens
        }
    }

    pub(crate) fn temperature_value(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }
}

pub(crate) fn normalize_provider(provider: &str) -> String {
    let p = provider.trim().to_lowercase();
    if p == "local" {
        "ollama".to_string()
    } else {
        p
    }
}

static RESET_AFTER: OnceLock<Regex> = OnceLock::new();

/// Wait before the next retry. A provider-supplied `reset after Ns` hint
/// wins (plus a 1 s buffer); otherwise exponential from 2 s.
pub(crate) fn retry_wait(err_text: &str, attempt: u32) -> Duration {
    let re = RESET_AFTER.get_or_init(|| Regex::new(r"(?i)reset after (\d+)s").unwrap());
    if let Some(caps) = re.captures(err_text) {
        if let Ok(secs) = caps[1].parse::<u64>() {
            return Duration::from_secs(secs + 1);
        }
    }
    Duration::from_secs(1u64 << (attempt + 1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server_uri: &str, cooldown_sec: f64) -> Client {
        Client::new(&LlmConfig {
            provider: "openai".into(),
            base_url: server_uri.into(),
            api_key: "test-key".into(),
            model: "gpt-test".into(),
            cooldown_sec,
            ..LlmConfig::default()
        })
    }

    fn chat_response(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    #[test]
    fn retry_wait_exponential_schedule() {
        assert_eq!(retry_wait("some error", 0), Duration::from_secs(2));
        assert_eq!(retry_wait("some error", 1), Duration::from_secs(4));
        assert_eq!(retry_wait("some error", 2), Duration::from_secs(8));
    }

    #[test]
    fn retry_wait_honors_reset_hint() {
        assert_eq!(retry_wait("quota: reset after 7s", 0), Duration::from_secs(8));
        assert_eq!(retry_wait("quota: reset after 7s", 2), Duration::from_secs(8));
        assert_eq!(retry_wait("Reset After 12s", 0), Duration::from_secs(13));
    }

    #[test]
    fn provider_normalization() {
        assert_eq!(normalize_provider(" OpenAI "), "openai");
        assert_eq!(normalize_provider("local"), "ollama");
        assert_eq!(normalize_provider(""), "");
    }

    #[test]
    fn system_prompt_prepended_without_mutating_input() {
        let mut client = client_for("http://unused", 0.0);
        client.system_prompt = "be terse".into();
        let original = vec![Message::user("hi")];
        let with = client.with_system_prompt(&original);
        assert_eq!(with.len(), 2);
        assert_eq!(with[0].role, "system");
        assert_eq!(with[0].content, "be terse");
        assert_eq!(with[1].content, "hi");
        assert_eq!(original.len(), 1);

        client.system_prompt = "   ".into();
        assert_eq!(client.with_system_prompt(&original).len(), 1);
    }

    #[test]
    fn defaults_for_tokens_and_temperature() {
        let client = client_for("http://unused", 0.0);
        assert_eq!(client.max_tokens_value(), 8192);
        assert!((client.temperature_value() - 0.7).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unsupported_provider_is_an_error() {
        let client = Client::new(&LlmConfig {
            provider: "frontier".into(),
            ..LlmConfig::default()
        });
        let err = client.chat(&[Message::user("hi")], &[]).await.unwrap_err();
        assert!(err.to_string().contains("unsupported llm provider"));
    }

    #[tokio::test]
    async fn cooldown_enforces_start_to_start_spacing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("ok")))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 0.3);
        let started = Instant::now();
        client.chat(&[Message::user("one")], &[]).await.unwrap();
        client.chat(&[Message::user("two")], &[]).await.unwrap();
        assert!(
            started.elapsed() >= Duration::from_millis(300),
            "second request must start at least one cooldown after the first"
        );
    }

    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("recovered")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 0.001);
        let started = Instant::now();
        let res = client.chat(&[Message::user("hi")], &[]).await.unwrap();
        assert_eq!(res.content, "recovered");
        // First retry waits 2^(0+1) = 2 s.
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 0.001);
        let err = client.chat(&[Message::user("hi")], &[]).await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn system_prompt_lands_first_on_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "messages": [
                    {"role": "system", "content": "be helpful"},
                    {"role": "user", "content": "hi"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("hello")))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = client_for(&server.uri(), 0.001);
        client.system_prompt = "be helpful".into();
        client.chat(&[Message::user("hi")], &[]).await.unwrap();
    }
}
