use crate::llm::client::{normalize_provider, Client, Message};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Cap on the model-listing response body.
const MAX_LIST_BODY: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    NotFound,
    Error,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::NotFound => write!(f, "not_found"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProbeStatus>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    id: String,
    #[serde(default)]
    created: Option<i64>,
}

impl Client {
    /// List the models the configured provider offers. OpenAI-compatible
    /// providers expose `GET {base}/models`; Antigravity has no listing
    /// API and reports the configured whitelist.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        // Same serialization as chat: one in-flight operation per client.
        let _serial = self.serialize_requests().await;
        match normalize_provider(&self.provider).as_str() {
            "antigravity" => Ok(self
                .antigravity_models
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    created: None,
                    status: None,
                })
                .collect()),
            "" | "openai" | "openrouter" | "ollama" => self.list_openai_compatible().await,
            _ => bail!(
                "listing models is not supported for provider: {}",
                self.provider
            ),
        }
    }

    async fn list_openai_compatible(&self) -> Result<Vec<ModelInfo>> {
        let endpoint = format!("{}/models", self.base_url.trim().trim_end_matches('/'));
        let resp = self
            .apply_headers(self.http().get(&endpoint))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        let body = &body[..body.len().min(MAX_LIST_BODY)];
        if !status.is_success() {
            bail!(
                "llm http {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body[..body.len().min(2048)])
            );
        }
        let parsed: ListResponse =
            serde_json::from_slice(body).context("invalid model list response")?;
        Ok(parsed
            .data
            .into_iter()
            .map(|entry| ModelInfo {
                id: entry.id,
                created: entry.created,
                status: None,
            })
            .collect())
    }

    /// Probe a single model with a minimal request, without retries.
    /// A rate-limited model exists; it reports `ok`.
    pub async fn probe_model(&self, model_id: &str) -> ModelInfo {
        let _serial = self.serialize_requests().await;
        let probe = self.probe_clone(model_id);
        let outcome = probe.dispatch(&[Message::user("hi")], &[]).await;

        let status = match outcome {
            Ok(_) => ProbeStatus::Ok,
            Err(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("404") || text.contains("not found") {
                    ProbeStatus::NotFound
                } else if text.contains("429")
                    || text.contains("quota")
                    || text.contains("exhausted")
                {
                    ProbeStatus::Ok
                } else {
                    ProbeStatus::Error
                }
            }
        };
        ModelInfo {
            id: model_id.to_string(),
            created: None,
            status: Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(provider: &str, base_url: &str) -> Client {
        Client::new(&LlmConfig {
            provider: provider.into(),
            base_url: base_url.into(),
            api_key: "k".into(),
            model: "m".into(),
            ..LlmConfig::default()
        })
    }

    #[tokio::test]
    async fn lists_openai_compatible_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(header("Authorization", "Bearer k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "gpt-a", "created": 1700000000},
                    {"id": "gpt-b"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let models = client("openai", &server.uri()).list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "gpt-a");
        assert_eq!(models[0].created, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn antigravity_reports_configured_whitelist() {
        let models = client("antigravity", "").list_models().await.unwrap();
        assert_eq!(models.len(), 4);
        assert!(models.iter().all(|m| m.id.starts_with("gemini")));
    }

    #[tokio::test]
    async fn listing_unsupported_provider_errors() {
        let err = client("anthropic", "").list_models().await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn listing_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let err = client("openai", &server.uri()).list_models().await.unwrap_err();
        assert!(err.to_string().contains("llm http 500"));
    }

    #[tokio::test]
    async fn probe_classifies_missing_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let info = client("openai", &server.uri()).probe_model("ghost").await;
        assert_eq!(info.status, Some(ProbeStatus::NotFound));
    }

    #[tokio::test]
    async fn probe_treats_rate_limit_as_existing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            // A single request proves the probe does not retry.
            .expect(1)
            .mount(&server)
            .await;

        let info = client("openai", &server.uri()).probe_model("busy").await;
        assert_eq!(info.status, Some(ProbeStatus::Ok));
    }

    #[tokio::test]
    async fn probe_reports_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let info = client("openai", &server.uri()).probe_model("live").await;
        assert_eq!(info.status, Some(ProbeStatus::Ok));
    }
}
