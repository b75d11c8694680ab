use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::base::{
    parse_retry_after, send_retry_delay, AllowList, Channel, HttpSendError,
    INBOUND_PUBLISH_TIMEOUT, MAX_SEND_ATTEMPTS,
};
use crate::config::WhatsAppConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";
const DEFAULT_API_VERSION: &str = "v24.0";
const DEFAULT_WEBHOOK_PATH: &str = "/whatsapp/webhook";
const DEFAULT_WEBHOOK_LISTEN: &str = "127.0.0.1:18791";
const MAX_WEBHOOK_BODY: usize = 2 * 1024 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

type HmacSha256 = Hmac<Sha256>;

/// WhatsApp Cloud API adapter: an embedded webhook server for inbound
/// messages, Graph API calls for outbound.
pub struct WhatsAppChannel {
    cfg: WhatsAppConfig,
    bus: Arc<Bus>,
    http: reqwest::Client,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

struct WebhookState {
    verify_token: String,
    app_secret: String,
    allow: AllowList,
    bus: Arc<Bus>,
}

impl WhatsAppChannel {
    pub fn new(cfg: WhatsAppConfig, bus: Arc<Bus>) -> Self {
        Self {
            cfg,
            bus,
            http: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        let base = non_empty(self.cfg.base_url.trim_end_matches('/'), DEFAULT_BASE_URL);
        let version = non_empty(&self.cfg.api_version, DEFAULT_API_VERSION);
        format!(
            "{}/{}/{}/messages",
            base,
            version,
            self.cfg.phone_number_id.trim()
        )
    }

    async fn send_once(&self, payload: &serde_json::Value) -> Result<()> {
        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(self.cfg.access_token.trim())
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        Err(HttpSendError {
            channel: "whatsapp",
            status: status.as_u16(),
            retry_after,
            body: body.trim().to_string(),
        }
        .into())
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if self.cfg.access_token.trim().is_empty() {
            return Err(anyhow!("whatsapp accessToken is empty"));
        }
        if self.cfg.phone_number_id.trim().is_empty() {
            return Err(anyhow!("whatsapp phoneNumberId is empty"));
        }
        if self.cfg.verify_token.trim().is_empty() {
            return Err(anyhow!("whatsapp verifyToken is empty"));
        }

        let run = shutdown.child_token();
        *self.shutdown.lock().expect("shutdown lock poisoned") = Some(run.clone());

        let state = Arc::new(WebhookState {
            verify_token: self.cfg.verify_token.trim().to_string(),
            app_secret: self.cfg.app_secret.trim().to_string(),
            allow: AllowList::new(self.cfg.allow_from.clone()),
            bus: self.bus.clone(),
        });
        let app = Router::new()
            .route(
                &normalize_webhook_path(&self.cfg.webhook_path),
                get(handle_verify).post(handle_inbound),
            )
            .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY))
            .with_state(state);

        let listen = non_empty(&self.cfg.webhook_listen, DEFAULT_WEBHOOK_LISTEN);
        let listener = match tokio::net::TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(err) => {
                *self.shutdown.lock().expect("shutdown lock poisoned") = None;
                return Err(err.into());
            }
        };
        debug!("whatsapp: webhook listening on {}", listen);

        let grace = run.clone();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { grace.cancelled().await });
        let mut server_task = tokio::spawn(async move { server.await });

        self.running.store(true, Ordering::SeqCst);
        let result = tokio::select! {
            res = &mut server_task => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.into()),
                Err(err) => Err(anyhow!("webhook server task failed: {}", err)),
            },
            () = run.cancelled() => {
                // Bounded drain, then hard stop.
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut server_task).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(err))) => Err(err.into()),
                    Ok(Err(err)) => Err(anyhow!("webhook server task failed: {}", err)),
                    Err(_) => {
                        server_task.abort();
                        Ok(())
                    }
                }
            }
        };
        self.running.store(false, Ordering::SeqCst);
        *self.shutdown.lock().expect("shutdown lock poisoned") = None;
        result
    }

    async fn stop(&self) -> Result<()> {
        let token = self
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let to = msg.chat_id.trim();
        if to.is_empty() {
            return Err(anyhow!("chat_id is empty"));
        }
        let content = msg.content.trim();
        if content.is_empty() {
            return Ok(());
        }

        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {"body": content, "preview_url": false},
        });
        if let Some(reply_id) = msg.reply_target() {
            payload["context"] = json!({"message_id": reply_id});
        }

        let mut attempt = 1;
        loop {
            match self.send_once(&payload).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let delay = send_retry_delay(&err, attempt);
                    match delay {
                        Some(wait) if attempt < MAX_SEND_ATTEMPTS => {
                            warn!(
                                "whatsapp: send failed ({}/{}), retry in {:?}: {}",
                                attempt, MAX_SEND_ATTEMPTS, wait, err
                            );
                            tokio::time::sleep(wait).await;
                            attempt += 1;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn handle_verify(
    State(state): State<Arc<WebhookState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .cloned()
        .unwrap_or_default();

    if mode.trim() != "subscribe" || token.trim().is_empty() || token.trim() != state.verify_token {
        return (StatusCode::FORBIDDEN, "forbidden".to_string()).into_response();
    }
    // Echo the challenge verbatim.
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        challenge,
    )
        .into_response()
}

async fn handle_inbound(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&state.app_secret, &body, signature) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let Ok(payload) = serde_json::from_slice::<WebhookPayload>(&body) else {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    };

    for event in extract_inbound(payload) {
        if !state.allow.allowed(&event.sender_id) {
            continue;
        }
        let msg = InboundMessage {
            channel: "whatsapp".into(),
            session_key: InboundMessage::session_key("whatsapp", &event.chat_id),
            sender_id: event.sender_id,
            chat_id: event.chat_id,
            content: event.content,
            attachments: vec![],
            delivery: event.delivery,
            timestamp: Utc::now(),
        };
        if tokio::time::timeout(INBOUND_PUBLISH_TIMEOUT, state.bus.publish_inbound(msg))
            .await
            .is_err()
        {
            warn!("whatsapp: inbound publish timed out, dropping event");
        }
    }

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
        .into_response()
}

/// Verify `X-Hub-Signature-256` over the raw body. An empty configured
/// secret accepts unsigned webhooks. Comparison is constant time.
pub(crate) fn verify_signature(app_secret: &str, body: &[u8], header: &str) -> bool {
    let secret = app_secret.trim();
    if secret.is_empty() {
        return true;
    }
    let header = header.trim();
    if !header.to_ascii_lowercase().starts_with("sha256=") {
        return false;
    }
    let Ok(given) = hex::decode(header["sha256=".len()..].trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let want = mac.finalize().into_bytes();
    if given.len() != want.len() {
        return false;
    }
    bool::from(given.as_slice().ct_eq(want.as_slice()))
}

fn normalize_webhook_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return DEFAULT_WEBHOOK_PATH.to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let value = value.trim();
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    field: String,
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    messages: Vec<InboundWire>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundWire {
    #[serde(default)]
    from: String,
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: WireText,
    #[serde(default)]
    button: WireButton,
    #[serde(default)]
    interactive: WireInteractive,
    #[serde(default)]
    image: WireMedia,
    #[serde(default)]
    video: WireMedia,
    #[serde(default)]
    document: WireDocument,
    #[serde(default)]
    reaction: WireReaction,
    #[serde(default)]
    context: WireContext,
}

#[derive(Debug, Default, Deserialize)]
struct WireText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireButton {
    #[serde(default)]
    text: String,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireInteractive {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    button_reply: WireInteractiveReply,
    #[serde(default)]
    list_reply: WireInteractiveReply,
}

#[derive(Debug, Default, Deserialize)]
struct WireInteractiveReply {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireMedia {
    #[serde(default)]
    caption: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireDocument {
    #[serde(default)]
    caption: String,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireReaction {
    #[serde(default)]
    emoji: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireContext {
    #[serde(default)]
    id: String,
}

struct InboundEvent {
    sender_id: String,
    chat_id: String,
    content: String,
    delivery: Delivery,
}

fn extract_inbound(payload: WebhookPayload) -> Vec<InboundEvent> {
    let mut out = Vec::new();
    if payload.object != "whatsapp_business_account" {
        return out;
    }
    for entry in payload.entry {
        for change in entry.changes {
            if change.field.trim() != "messages" {
                continue;
            }
            for msg in change.value.messages {
                let Some(content) = inbound_content(&msg) else {
                    continue;
                };
                let sender = msg.from.trim().to_string();
                if sender.is_empty() {
                    continue;
                }
                out.push(InboundEvent {
                    chat_id: sender.clone(),
                    sender_id: sender,
                    content,
                    delivery: Delivery {
                        message_id: msg.id.trim().to_string(),
                        reply_to_id: msg.context.id.trim().to_string(),
                        thread_id: String::new(),
                        is_direct: true,
                    },
                });
            }
        }
    }
    out
}

/// Render a wire message into agent-visible text. Media arrives as a
/// bracketed placeholder with any caption the user attached.
fn inbound_content(msg: &InboundWire) -> Option<String> {
    let text = match msg.kind.trim() {
        "text" => msg.text.body.trim().to_string(),
        "button" => {
            let button = msg.button.text.trim();
            if button.is_empty() {
                msg.button.payload.trim().to_string()
            } else {
                button.to_string()
            }
        }
        "interactive" => {
            let reply = match msg.interactive.kind.trim() {
                "button_reply" => &msg.interactive.button_reply,
                "list_reply" => &msg.interactive.list_reply,
                _ => return None,
            };
            let title = reply.title.trim();
            if title.is_empty() {
                reply.id.trim().to_string()
            } else {
                title.to_string()
            }
        }
        "image" => captioned("[Image]", &msg.image.caption),
        "video" => captioned("[Video]", &msg.video.caption),
        "document" => {
            let caption = msg.document.caption.trim();
            let name = msg.document.filename.trim();
            if !caption.is_empty() {
                format!("[Document] {}", caption)
            } else if !name.is_empty() {
                format!("[Document] {}", name)
            } else {
                "[Document]".to_string()
            }
        }
        "audio" => "[Voice Message]".to_string(),
        "reaction" => captioned("[Reaction]", &msg.reaction.emoji),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn captioned(tag: &str, caption: &str) -> String {
    let caption = caption.trim();
    if caption.is_empty() {
        tag.to_string()
    } else {
        format!("{} {}", tag, caption)
    }
}
