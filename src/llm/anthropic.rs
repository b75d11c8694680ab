use crate::llm::client::{ChatResult, Client, Message, ToolCall, ToolDefinition};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API: `POST {base}/v1/messages`. System messages
/// move to the top-level `system` field; tool traffic becomes
/// `tool_use` / `tool_result` content blocks.
pub(crate) async fn chat(
    client: &Client,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Result<ChatResult> {
    let base = client.base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    let endpoint = format!("{}/v1/messages", base);

    let (system, wire_messages) = build_messages(messages);
    let mut payload = json!({
        "model": client.model,
        "max_tokens": client.max_tokens_value(),
        "temperature": client.temperature_value(),
        "messages": wire_messages,
    });
    if !system.is_empty() {
        payload["system"] = json!(system);
    }
    if !tools.is_empty() {
        payload["tools"] = json!(tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            }))
            .collect::<Vec<_>>());
    }

    let resp = client
        .apply_headers(
            client
                .http()
                .post(&endpoint)
                .header("anthropic-version", API_VERSION),
        )
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

    let body: Value = serde_json::from_slice(&body).context("invalid messages response")?;
    parse_response(&body)
}

/// Split out system text and map the rest to Anthropic's message shape.
fn build_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut wire = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "tool" => {
                wire.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                        "content": msg.content,
                    }]
                }));
            }
            "assistant" => {
                if let Some(tool_calls) = &msg.tool_calls {
                    let mut blocks = Vec::new();
                    if !msg.content.trim().is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for tc in tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    wire.push(json!({"role": "assistant", "content": blocks}));
                } else {
                    wire.push(json!({"role": "assistant", "content": msg.content}));
                }
            }
            _ => wire.push(json!({"role": "user", "content": msg.content})),
        }
    }

    (system_parts.join("\n\n"), wire)
}

fn parse_response(body: &Value) -> Result<ChatResult> {
    let blocks = body["content"]
        .as_array()
        .context("no content in messages response")?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str().unwrap_or("") {
            "text" => content.push_str(block["text"].as_str().unwrap_or("")),
            "tool_use" => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    Ok(ChatResult {
        content,
        tool_calls,
    })
}
