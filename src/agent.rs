use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::llm::{Client, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Messages kept per session before the oldest turns fall off.
const MAX_SESSION_MESSAGES: usize = 40;

/// Thin reply loop between the bus and the LLM client: one chat turn per
/// inbound message, keyed by session. With no client configured it
/// echoes, which is how channel connectivity is tested.
///
/// The full prompt/tool-calling agent is a separate concern layered on
/// the same bus contract.
pub struct AgentLoop {
    bus: Arc<Bus>,
    llm: Option<Arc<Client>>,
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl AgentLoop {
    pub fn new(bus: Arc<Bus>, llm: Option<Arc<Client>>) -> Self {
        Self {
            bus,
            llm,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "agent: reply loop started ({} mode)",
            if self.llm.is_some() { "llm" } else { "echo" }
        );
        loop {
            let msg = tokio::select! {
                () = shutdown.cancelled() => break,
                msg = self.bus.consume_inbound() => match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };

            let reply = match &self.llm {
                None => msg.content.clone(),
                Some(client) => match self.reply_via_llm(client, &msg).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        error!("agent: llm turn failed for {}: {}", msg.session_key, err);
                        format!("(request failed: {})", err)
                    }
                },
            };
            if reply.trim().is_empty() {
                continue;
            }

            let outbound = OutboundMessage {
                channel: msg.channel.clone(),
                chat_id: msg.chat_id.clone(),
                content: reply,
                reply_to: String::new(),
                delivery: Delivery {
                    message_id: String::new(),
                    reply_to_id: msg.delivery.message_id.clone(),
                    thread_id: msg.delivery.thread_id.clone(),
                    is_direct: msg.delivery.is_direct,
                },
            };
            if self.bus.publish_outbound(outbound).await.is_err() {
                break;
            }
        }
        info!("agent: reply loop stopped");
    }

    async fn reply_via_llm(&self, client: &Client, msg: &InboundMessage) -> anyhow::Result<String> {
        let history = {
            let mut sessions = self.sessions.lock().await;
            let history = sessions.entry(msg.session_key.clone()).or_default();
            history.push(Message::user(render_content(msg)));
            if history.len() > MAX_SESSION_MESSAGES {
                let excess = history.len() - MAX_SESSION_MESSAGES;
                history.drain(..excess);
            }
            history.clone()
        };

        let result = client.chat(&history, &[]).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(history) = sessions.get_mut(&msg.session_key) {
            history.push(Message::assistant(result.content.clone(), None));
        }
        Ok(result.content)
    }
}

/// The user's text plus a line per attachment, so a text-only model
/// still learns what was shared.
fn render_content(msg: &InboundMessage) -> String {
    if msg.attachments.is_empty() {
        return msg.content.clone();
    }
    let mut out = msg.content.clone();
    for att in &msg.attachments {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!(
            "[attachment: {} ({}) {}]",
            att.name, att.mime_type, att.url
        ));
    }
    out
}
