use crate::llm::client::{ChatResult, Client, Message, ToolCall, ToolDefinition};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini `POST {base}/v1beta/models/{model}:generateContent`.
pub(crate) async fn chat(
    client: &Client,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Result<ChatResult> {
    let base = client.base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    let endpoint = format!("{}/v1beta/models/{}:generateContent", base, client.model);
    generate_content(client, &endpoint, messages, tools).await
}

/// Issue a `generateContent`-shaped request against `endpoint`. Shared
/// with the Antigravity dialect, which differs only in endpoint layout.
pub(crate) async fn generate_content(
    client: &Client,
    endpoint: &str,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Result<ChatResult> {
    let (system_parts, contents) = build_contents(messages);
    let mut payload = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": client.max_tokens_value(),
            "temperature": client.temperature_value(),
        },
    });
    if !system_parts.is_empty() {
        payload["systemInstruction"] = json!({
            "parts": [{"text": system_parts.join("\n\n")}]
        });
    }
    if !tools.is_empty() {
        payload["tools"] = json!([{
            "functionDeclarations": tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }))
                .collect::<Vec<_>>()
        }]);
    }

    let resp = client
        .apply_headers(client.http().post(endpoint))
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

    let body: Value = serde_json::from_slice(&body).context("invalid generateContent response")?;
    parse_response(&body)
}

fn build_contents(messages: &[Message]) -> (Vec<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "tool" => {
                // Tool results travel as functionResponse parts. Gemini
                // has no call ids; the function name is the correlation.
                let name = msg.tool_call_id.as_deref().unwrap_or("unknown");
                let response: Value = serde_json::from_str(&msg.content)
                    .unwrap_or_else(|_| json!({"result": msg.content}));
                contents.push(json!({
                    "role": "function",
                    "parts": [{
                        "functionResponse": {"name": name, "response": response}
                    }]
                }));
            }
            "assistant" => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({"text": msg.content}));
                }
                if let Some(tool_calls) = &msg.tool_calls {
                    for tc in tool_calls {
                        parts.push(json!({
                            "functionCall": {"name": tc.name, "args": tc.arguments}
                        }));
                    }
                }
                if parts.is_empty() {
                    parts.push(json!({"text": ""}));
                }
                contents.push(json!({"role": "model", "parts": parts}));
            }
            _ => contents.push(json!({
                "role": "user",
                "parts": [{"text": msg.content}]
            })),
        }
    }

    (system_parts, contents)
}

fn parse_response(body: &Value) -> Result<ChatResult> {
    let candidate = body["candidates"]
        .as_array()
        .and_then(|arr| arr.first())
        .context("no candidates in generateContent response")?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for (i, part) in parts.iter().enumerate() {
            if let Some(text) = part["text"].as_str() {
                content.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call["name"].as_str().unwrap_or("").to_string();
                // No ids on the wire; reuse the function name so the
                // functionResponse round-trip lines up.
                let id = if name.is_empty() {
                    format!("gemini_call_{}", i)
                } else {
                    name.clone()
                };
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: call["args"].clone(),
                });
            }
        }
    }

    Ok(ChatResult {
        content,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_goes_to_system_instruction() {
        let (system, contents) =
            build_contents(&[Message::system("stay factual"), Message::user("hi")]);
        assert_eq!(system, vec!["stay factual".to_string()]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
    }

    #[test]
    fn assistant_maps_to_model_role() {
        let (_, contents) = build_contents(&[Message::assistant("sure", None)]);
        assert_eq!(contents[0]["role"], "model");
        assert_eq!(contents[0]["parts"][0]["text"], "sure");
    }

    #[test]
    fn tool_results_become_function_responses() {
        let (_, contents) = build_contents(&[Message::tool_result("weather", r#"{"t": 20}"#)]);
        assert_eq!(contents[0]["role"], "function");
        assert_eq!(
            contents[0]["parts"][0]["functionResponse"]["name"],
            "weather"
        );
        assert_eq!(
            contents[0]["parts"][0]["functionResponse"]["response"]["t"],
            20
        );
    }

    #[test]
    fn non_json_tool_results_are_wrapped() {
        let (_, contents) = build_contents(&[Message::tool_result("shell", "plain text")]);
        assert_eq!(
            contents[0]["parts"][0]["functionResponse"]["response"]["result"],
            "plain text"
        );
    }

    #[test]
    fn parses_text_and_function_calls() {
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"text": "let me check"},
                {"functionCall": {"name": "weather", "args": {"city": "Kyoto"}}}
            ]}}]
        });
        let res = parse_response(&body).unwrap();
        assert_eq!(res.content, "let me check");
        assert_eq!(res.tool_calls[0].id, "weather");
        assert_eq!(res.tool_calls[0].arguments["city"], "Kyoto");
    }

    #[test]
    fn empty_candidates_is_an_error() {
        assert!(parse_response(&json!({"candidates": []})).is_err());
    }
}
