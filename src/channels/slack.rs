use crate::bus::{Attachment, AttachmentKind, Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::base::{
    parse_retry_after, reconnect_delay, send_retry_delay, AllowList, Channel, GroupPolicy,
    HttpSendError, INBOUND_PUBLISH_TIMEOUT, MAX_SEND_ATTEMPTS,
};
use crate::config::SlackConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const API_BASE: &str = "https://slack.com/api";

/// Slack adapter over Socket Mode: a WebSocket for inbound events, Web
/// API calls for outbound.
pub struct SlackChannel {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: SlackConfig,
    bus: Arc<Bus>,
    allow: AllowList,
    http: reqwest::Client,
    bot_user_id: Mutex<String>,
    user_cache: tokio::sync::Mutex<HashMap<String, String>>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl SlackChannel {
    pub fn new(cfg: SlackConfig, bus: Arc<Bus>) -> Self {
        let allow = AllowList::new(cfg.allow_from.clone());
        Self {
            inner: Arc::new(Inner {
                cfg,
                bus,
                allow,
                http: reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .timeout(Duration::from_secs(20))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
                bot_user_id: Mutex::new(String::new()),
                user_cache: tokio::sync::Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        }
    }
}

impl Inner {
    /// Call a Web API method with the bot token. HTTP failures carry the
    /// status for the retry classifier; `ok: false` responses surface the
    /// Slack error string, with `ratelimited` mapped to a 429.
    async fn api_call(&self, method: &str, params: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{}", API_BASE, method))
            .bearer_auth(self.cfg.bot_token.trim())
            .json(params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpSendError {
                channel: "slack",
                status: status.as_u16(),
                retry_after,
                body: body.trim().to_string(),
            }
            .into());
        }

        let body: Value = resp.json().await?;
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body);
        }
        let api_error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if api_error == "ratelimited" || api_error == "rate_limited" {
            return Err(HttpSendError {
                channel: "slack",
                status: 429,
                retry_after: None,
                body: api_error,
            }
            .into());
        }
        Err(anyhow!("slack api error: {}", api_error))
    }

    async fn socket_url(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/apps.connections.open", API_BASE))
            .bearer_auth(self.cfg.app_token.trim())
            .send()
            .await?;
        let body: Value = resp.json().await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(anyhow!("apps.connections.open failed: {}", err));
        }
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("apps.connections.open returned no url"))
    }

    /// One WebSocket session: connect, ack envelopes, feed events to the
    /// handler. Returns on disconnect or cancellation.
    async fn run_socket(self: &Arc<Self>, run: &CancellationToken) -> Result<()> {
        let ws_url = self.socket_url().await?;
        let url = url::Url::parse(&ws_url)?;
        let (ws_stream, resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!("slack: socket mode connected (status {})", resp.status());
        let (mut write, mut read) = ws_stream.split();

        loop {
            let msg = tokio::select! {
                () = run.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => msg,
            };
            let Some(msg) = msg else { return Ok(()) };
            match msg {
                Ok(WsMessage::Text(text)) => {
                    let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let kind = envelope.get("type").and_then(Value::as_str).unwrap_or("");
                    match kind {
                        "hello" => debug!("slack: socket mode hello"),
                        "disconnect" => {
                            // Slack asks clients to refresh the connection.
                            debug!("slack: socket refresh requested");
                            return Ok(());
                        }
                        "events_api" => {
                            if let Some(envelope_id) =
                                envelope.get("envelope_id").and_then(Value::as_str)
                            {
                                let ack = json!({"envelope_id": envelope_id, "payload": {}});
                                if let Err(err) =
                                    write.send(WsMessage::text(ack.to_string())).await
                                {
                                    error!("slack: failed to ack envelope: {}", err);
                                }
                            }
                            if let Some(event) = envelope
                                .get("payload")
                                .and_then(|p| p.get("event"))
                            {
                                let event_type =
                                    event.get("type").and_then(Value::as_str).unwrap_or("");
                                if event_type == "message" || event_type == "app_mention" {
                                    self.handle_event(event_type, event).await;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(WsMessage::Ping(data)) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Ok(WsMessage::Close(_)) => {
                    info!("slack: socket mode connection closed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event_type: &str, event: &Value) {
        // Bot echoes and edits carry a subtype; file shares are real
        // user messages.
        if let Some(subtype) = event.get("subtype").and_then(Value::as_str) {
            if subtype != "file_share" {
                return;
            }
        }

        let user_id = event.get("user").and_then(Value::as_str).unwrap_or("");
        let channel_id = event.get("channel").and_then(Value::as_str).unwrap_or("");
        let channel_type = event
            .get("channel_type")
            .and_then(Value::as_str)
            .unwrap_or("");
        let mut text = event
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if user_id.is_empty() || channel_id.is_empty() {
            return;
        }

        let bot_id = self.bot_user_id.lock().expect("bot id lock poisoned").clone();
        if user_id == bot_id {
            return;
        }

        if !allowed_by_policy(
            self.cfg.group_policy,
            &self.cfg.group_allow_from,
            event_type,
            channel_id,
            channel_type,
        ) {
            return;
        }

        text = strip_bot_mention(&text, &bot_id);

        if !self.allow.allowed(user_id) {
            return;
        }

        let attachments = inbound_attachments(event, self.cfg.bot_token.trim());
        if text.trim().is_empty() && attachments.is_empty() {
            return;
        }

        let sender_id = self.enriched_sender_id(user_id).await;
        let ts = event.get("ts").and_then(Value::as_str).unwrap_or("");
        let thread_ts = event.get("thread_ts").and_then(Value::as_str).unwrap_or("");

        let inbound = InboundMessage {
            channel: "slack".into(),
            sender_id,
            session_key: InboundMessage::session_key("slack", channel_id),
            chat_id: channel_id.to_string(),
            content: text.trim().to_string(),
            attachments,
            delivery: build_delivery(ts, thread_ts, channel_type),
            timestamp: Utc::now(),
        };
        if tokio::time::timeout(INBOUND_PUBLISH_TIMEOUT, self.bus.publish_inbound(inbound))
            .await
            .is_err()
        {
            warn!("slack: inbound publish timed out, dropping event");
        }
    }

    /// `"{id}|{username}"` when the profile lookup succeeds; cached per
    /// user id.
    async fn enriched_sender_id(&self, user_id: &str) -> String {
        {
            let cache = self.user_cache.lock().await;
            if let Some(cached) = cache.get(user_id) {
                return cached.clone();
            }
        }
        let mut enriched = user_id.to_string();
        if let Ok(info) = self.api_call("users.info", &json!({"user": user_id})).await {
            if let Some(name) = info
                .get("user")
                .and_then(|u| u.get("name"))
                .and_then(Value::as_str)
            {
                enriched = format!("{}|{}", user_id, name);
            }
        }
        self.user_cache
            .lock()
            .await
            .insert(user_id.to_string(), enriched.clone());
        enriched
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = self.inner.clone();
        if inner.cfg.bot_token.trim().is_empty() {
            return Err(anyhow!("slack botToken is empty"));
        }
        if inner.cfg.app_token.trim().is_empty() {
            return Err(anyhow!("slack appToken is empty (needed for Socket Mode)"));
        }

        let run = shutdown.child_token();
        *inner.shutdown.lock().expect("shutdown lock poisoned") = Some(run.clone());

        let auth = match inner.api_call("auth.test", &json!({})).await {
            Ok(auth) => auth,
            Err(err) => {
                *inner.shutdown.lock().expect("shutdown lock poisoned") = None;
                return Err(err);
            }
        };
        let bot_id = auth
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        info!(
            "slack: connected as {} ({})",
            auth.get("user")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown"),
            bot_id
        );
        *inner.bot_user_id.lock().expect("bot id lock poisoned") = bot_id;

        inner.running.store(true, Ordering::SeqCst);
        let mut reconnect_attempt: u32 = 0;
        while !run.is_cancelled() {
            match inner.run_socket(&run).await {
                Ok(()) => {
                    reconnect_attempt = 0;
                }
                Err(err) => {
                    if run.is_cancelled() {
                        break;
                    }
                    let delay = reconnect_delay(reconnect_attempt);
                    reconnect_attempt += 1;
                    warn!("slack: socket error, reconnecting in {:?}: {}", delay, err);
                    tokio::select! {
                        () = run.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        inner.running.store(false, Ordering::SeqCst);
        *inner.shutdown.lock().expect("shutdown lock poisoned") = None;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let token = self
            .inner
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
        let content = msg.content.trim();
        if content.is_empty() {
            return Ok(());
        }
        let chat_id = msg.chat_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("chat_id is empty"));
        }

        let mut params = json!({
            "channel": chat_id,
            "text": content,
        });
        if let Some(thread_ts) = thread_target(msg) {
            params["thread_ts"] = json!(thread_ts);
        }

        let mut attempt = 1;
        loop {
            match self.inner.api_call("chat.postMessage", &params).await {
                Ok(_) => return Ok(()),
                Err(err) => match send_retry_delay(&err, attempt) {
                    Some(wait) if attempt < MAX_SEND_ATTEMPTS => {
                        warn!(
                            "slack: send failed ({}/{}), retry in {:?}: {}",
                            attempt, MAX_SEND_ATTEMPTS, wait, err
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// Admission for one event. DMs and MPIMs always pass; groups follow the
/// configured policy. Mention policy admits only `app_mention` — Slack
/// also emits a plain `message` for the same utterance, so accepting
/// both would double-deliver.
fn allowed_by_policy(
    policy: GroupPolicy,
    group_allow: &[String],
    event_type: &str,
    channel_id: &str,
    channel_type: &str,
) -> bool {
    if channel_type == "im" || channel_type == "mpim" {
        return true;
    }
    match policy {
        GroupPolicy::Open => true,
        GroupPolicy::Allowlist => group_allow.iter().any(|c| c.trim() == channel_id),
        GroupPolicy::Mention => event_type == "app_mention",
    }
}

/// Strip a leading `<@BOTID>` (with optional `:` or `,`) from the text.
/// Mentions of other users, or mid-text mentions, stay.
fn strip_bot_mention(text: &str, bot_id: &str) -> String {
    if bot_id.is_empty() {
        return text.to_string();
    }
    let Ok(re) = Regex::new(&format!(r"^<@{}>[:,]?\s*", regex::escape(bot_id))) else {
        return text.to_string();
    };
    re.replace(text, "").into_owned()
}

fn build_delivery(ts: &str, thread_ts: &str, channel_type: &str) -> Delivery {
    let thread = if thread_ts.trim().is_empty() {
        ts
    } else {
        thread_ts
    };
    Delivery {
        message_id: ts.trim().to_string(),
        reply_to_id: String::new(),
        thread_id: thread.trim().to_string(),
        is_direct: channel_type == "im",
    }
}

/// Thread timestamp for an outbound message. DMs post flat; everything
/// else threads onto the typed thread id, falling back to the legacy
/// reply_to.
fn thread_target(msg: &OutboundMessage) -> Option<String> {
    if msg.delivery.is_direct {
        return None;
    }
    for candidate in [msg.delivery.thread_id.trim(), msg.reply_to.trim()] {
        if !candidate.is_empty() {
            return Some(candidate.to_string());
        }
    }
    None
}

fn inbound_attachments(event: &Value, bot_token: &str) -> Vec<Attachment> {
    let Some(files) = event.get("files").and_then(Value::as_array) else {
        return vec![];
    };
    let mut out = Vec::with_capacity(files.len());
    for file in files {
        let id = file.get("id").and_then(Value::as_str).unwrap_or("");
        let url = file
            .get("url_private_download")
            .and_then(Value::as_str)
            .or_else(|| file.get("url_private").and_then(Value::as_str))
            .unwrap_or("");
        if id.is_empty() || url.is_empty() {
            continue;
        }
        let mime_type = file
            .get("mimetype")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let mut headers = HashMap::new();
        if !bot_token.is_empty() {
            headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", bot_token),
            );
        }
        out.push(Attachment {
            id: id.to_string(),
            name: file
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            kind: AttachmentKind::from_mime(&mime_type),
            mime_type,
            size_bytes: file.get("size").and_then(Value::as_i64).unwrap_or(0),
            url: url.to_string(),
            headers,
        });
    }
    out
}
