use crate::llm::client::{ChatResult, Client, Message, ToolDefinition};
use crate::llm::gemini;
use anyhow::{bail, Result};

/// Antigravity speaks the `generateContent` wire shape but lives behind
/// its own endpoint, so the base URL must be configured explicitly.
pub(crate) async fn chat(
    client: &Client,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Result<ChatResult> {
    let base = client.base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        bail!("antigravity requires llm.baseUrl to be configured");
    }
    let endpoint = format!("{}/models/{}:generateContent", base, client.model);
    gemini::generate_content(client, &endpoint, messages, tools).await
}
