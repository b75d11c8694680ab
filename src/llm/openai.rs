use crate::llm::client::{ChatResult, Client, Message, ToolCall, ToolDefinition};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible `POST {base}/chat/completions`, also serving
/// OpenRouter and Ollama.
pub(crate) async fn chat(
    client: &Client,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Result<ChatResult> {
    let base = client.base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    let endpoint = format!("{}/chat/completions", base);

    let wire_messages: Vec<Value> = messages.iter().map(wire_message).collect();
    let mut payload = json!({
        "model": client.model,
        "messages": wire_messages,
        "max_tokens": client.max_tokens_value(),
        "temperature": client.temperature_value(),
    });
    if !tools.is_empty() {
        payload["tools"] = json!(tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            }))
            .collect::<Vec<_>>());
    }

    let resp = client
        .apply_headers(client.http().post(&endpoint))
        .json(&payload)
        .send()
        .await?;
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        bail!(
            "llm http {}: {}",
            status.as_u16(),
            String::from_utf8_lossy(&body[..body.len().min(2048)])
        );
    }

    let body: Value = serde_json::from_slice(&body).context("invalid chat completions response")?;
    parse_response(&body)
}

fn wire_message(msg: &Message) -> Value {
    let mut wire = json!({
        "role": msg.role,
        "content": msg.content,
    });
    if let Some(tool_calls) = &msg.tool_calls {
        wire["tool_calls"] = json!(tool_calls
            .iter()
            .map(|tc| {
                let arguments =
                    serde_json::to_string(&tc.arguments).unwrap_or_else(|_| "{}".to_string());
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {"name": tc.name, "arguments": arguments},
                })
            })
            .collect::<Vec<_>>());
    }
    if let Some(tool_call_id) = &msg.tool_call_id {
        wire["tool_call_id"] = json!(tool_call_id);
    }
    wire
}

fn parse_response(body: &Value) -> Result<ChatResult> {
    let message = body["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .map(|choice| &choice["message"])
        .context("no choices in chat completions response")?;

    let content = message["content"].as_str().unwrap_or("").to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let Some(function) = call["function"].as_object() else {
                continue;
            };
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall {
                id: call["id"].as_str().unwrap_or("").to_string(),
                name: function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                arguments,
            });
        }
    }

    Ok(ChatResult {
        content,
        tool_calls,
    })
}
