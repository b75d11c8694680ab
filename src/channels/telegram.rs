use crate::bus::{Attachment, AttachmentKind, Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::base::{
    send_retry_delay, AllowList, Channel, GroupPolicy, HttpSendError, INBOUND_PUBLISH_TIMEOUT,
    MAX_SEND_ATTEMPTS,
};
use crate::config::TelegramConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";
const FILE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const TYPING_HINT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Telegram Bot API adapter. Long-polls `getUpdates` with a bounded
/// worker pool; no webhook.
pub struct TelegramChannel {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: TelegramConfig,
    bus: Arc<Bus>,
    allow: AllowList,
    poll_timeout: i64,
    workers: usize,
    http: reqwest::Client,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
struct BotIdentity {
    id: i64,
    username: String,
}

impl TelegramChannel {
    pub fn new(cfg: TelegramConfig, bus: Arc<Bus>) -> Self {
        let poll_timeout = clamp_poll_timeout(cfg.poll_timeout_sec);
        let workers = clamp_workers(cfg.workers);
        let allow = AllowList::new(cfg.allow_from.clone());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs((poll_timeout + 15) as u64))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            inner: Arc::new(Inner {
                cfg,
                bus,
                allow,
                poll_timeout,
                workers: workers as usize,
                http,
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        }
    }
}

impl Inner {
    fn api_url(&self, method: &str) -> String {
        let base = self.cfg.base_url.trim().trim_end_matches('/');
        let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
        format!("{}/bot{}/{}", base, self.cfg.token.trim(), method)
    }

    fn file_url(&self, file_path: &str) -> Result<String> {
        let base = self.cfg.base_url.trim().trim_end_matches('/');
        let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
        let token = self.cfg.token.trim();
        if token.is_empty() {
            return Err(anyhow!("telegram token is empty"));
        }
        let file_path = file_path.trim().trim_start_matches('/');
        if file_path.is_empty() {
            return Err(anyhow!("telegram file path is empty"));
        }
        Ok(format!("{}/file/bot{}/{}", base, token, file_path))
    }

    /// Invoke a Bot API method. API-level failures are mapped onto
    /// `HttpSendError` so the shared retry classifier applies.
    async fn call(&self, method: &str, params: &Value, timeout: Option<Duration>) -> Result<Value> {
        let mut req = self.http.post(self.api_url(method)).json(params);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if let Ok(parsed) = serde_json::from_slice::<ApiResponse>(&body) {
            if parsed.ok {
                return Ok(parsed.result);
            }
            return Err(HttpSendError {
                channel: "telegram",
                status: parsed.error_code.unwrap_or(i64::from(status.as_u16())) as u16,
                retry_after: parsed
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(|s| Duration::from_secs(s.max(0) as u64)),
                body: parsed.description.unwrap_or_default(),
            }
            .into());
        }
        // Non-JSON body, e.g. an HTML error page from a proxy.
        Err(HttpSendError {
            channel: "telegram",
            status: status.as_u16(),
            retry_after: None,
            body: String::from_utf8_lossy(&body[..body.len().min(512)]).into_owned(),
        }
        .into())
    }

    async fn send_message_with_retry(&self, params: &Value) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.call("sendMessage", params, None).await {
                Ok(_) => return Ok(()),
                Err(err) => match send_retry_delay(&err, attempt) {
                    Some(wait) if attempt < MAX_SEND_ATTEMPTS => {
                        warn!(
                            "telegram: send failed ({}/{}), retry in {:?}: {}",
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

    async fn handle_update(self: &Arc<Self>, bot: &BotIdentity, update: Update) {
        let Some(msg) = update.message.or(update.edited_message) else {
            return;
        };
        let Some(from) = &msg.from else { return };
        if from.is_bot || from.id == bot.id {
            return;
        }

        let sender_id = sender_id(from);
        if !self.allow.allowed(&sender_id) {
            return;
        }

        let is_direct = msg.chat.kind == "private";
        let mut content = message_content(&msg);
        if !is_direct {
            match self.cfg.group_policy {
                GroupPolicy::Open => {}
                GroupPolicy::Allowlist => {
                    let chat = msg.chat.id.to_string();
                    if !self.cfg.group_allow_from.iter().any(|c| c.trim() == chat) {
                        return;
                    }
                }
                GroupPolicy::Mention => {
                    let Some(stripped) = strip_mention(&content, &bot.username) else {
                        return;
                    };
                    content = stripped;
                }
            }
        }
        if is_direct || self.cfg.group_policy != GroupPolicy::Mention {
            // Mentions may still appear outside mention policy; drop them
            // from the text either way.
            if let Some(stripped) = strip_mention(&content, &bot.username) {
                content = stripped;
            }
        }

        let attachments = self.inbound_attachments(&msg).await;
        if content.is_empty() && attachments.is_empty() {
            return;
        }

        let chat_id = msg.chat.id.to_string();
        self.spawn_typing_hint(msg.chat.id);

        let inbound = InboundMessage {
            channel: "telegram".into(),
            sender_id,
            session_key: InboundMessage::session_key("telegram", &chat_id),
            chat_id,
            content,
            attachments,
            delivery: build_delivery(&msg),
            timestamp: Utc::now(),
        };
        // A saturated bus must not wedge the poll workers.
        if tokio::time::timeout(INBOUND_PUBLISH_TIMEOUT, self.bus.publish_inbound(inbound))
            .await
            .is_err()
        {
            warn!("telegram: inbound publish timed out, dropping update");
        }
    }

    async fn inbound_attachments(&self, msg: &TgMessage) -> Vec<Attachment> {
        let mut candidates: Vec<FileRef> = Vec::new();
        if let Some(photo) = msg.photo.last() {
            candidates.push(FileRef {
                id: photo.file_id.clone(),
                name: "photo.jpg".into(),
                mime_type: "image/jpeg".into(),
                kind: Some(AttachmentKind::Image),
                size: photo.file_size.unwrap_or(0),
            });
        }
        if let Some(audio) = &msg.audio {
            candidates.push(FileRef {
                id: audio.file_id.clone(),
                name: fallback(&audio.file_name, "audio"),
                mime_type: audio.mime_type.clone().unwrap_or_default(),
                kind: Some(AttachmentKind::Audio),
                size: audio.file_size.unwrap_or(0),
            });
        }
        if let Some(voice) = &msg.voice {
            candidates.push(FileRef {
                id: voice.file_id.clone(),
                name: "voice.ogg".into(),
                mime_type: fallback(&voice.mime_type, "audio/ogg"),
                kind: Some(AttachmentKind::Audio),
                size: voice.file_size.unwrap_or(0),
            });
        }
        if let Some(video) = &msg.video {
            candidates.push(FileRef {
                id: video.file_id.clone(),
                name: fallback(&video.file_name, "video"),
                mime_type: video.mime_type.clone().unwrap_or_default(),
                kind: Some(AttachmentKind::Video),
                size: video.file_size.unwrap_or(0),
            });
        }
        if let Some(doc) = &msg.document {
            candidates.push(FileRef {
                id: doc.file_id.clone(),
                name: fallback(&doc.file_name, "document"),
                mime_type: doc.mime_type.clone().unwrap_or_default(),
                kind: None,
                size: doc.file_size.unwrap_or(0),
            });
        }

        let mut out = Vec::with_capacity(candidates.len());
        for cand in candidates {
            let file_id = cand.id.trim();
            if file_id.is_empty() {
                continue;
            }
            let url = match self.resolve_file_url(file_id).await {
                Ok(url) => url,
                Err(err) => {
                    debug!("telegram: failed to resolve file {}: {}", file_id, err);
                    continue;
                }
            };
            let mime_type = if cand.mime_type.trim().is_empty() {
                "application/octet-stream".to_string()
            } else {
                cand.mime_type.trim().to_string()
            };
            let kind = cand
                .kind
                .unwrap_or_else(|| AttachmentKind::from_mime(&mime_type));
            out.push(Attachment {
                id: file_id.to_string(),
                name: cand.name.trim().to_string(),
                mime_type,
                kind,
                size_bytes: cand.size,
                url,
                headers: std::collections::HashMap::new(),
            });
        }
        out
    }

    async fn resolve_file_url(&self, file_id: &str) -> Result<String> {
        let result = self
            .call(
                "getFile",
                &json!({"file_id": file_id}),
                Some(FILE_RESOLVE_TIMEOUT),
            )
            .await?;
        let file: TgFile = serde_json::from_value(result)?;
        let path = file.file_path.unwrap_or_default();
        if path.trim().is_empty() {
            return Err(anyhow!("telegram file path is empty"));
        }
        self.file_url(&path)
    }

    /// Fire-and-forget typing indicator; never blocks message handling.
    fn spawn_typing_hint(self: &Arc<Self>, chat_id: i64) {
        let inner = self.clone();
        tokio::spawn(async move {
            let _ = inner
                .call(
                    "sendChatAction",
                    &json!({"chat_id": chat_id, "action": "typing"}),
                    Some(TYPING_HINT_TIMEOUT),
                )
                .await;
        });
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = self.inner.clone();
        if inner.cfg.token.trim().is_empty() {
            return Err(anyhow!("telegram token is empty"));
        }

        let run = shutdown.child_token();
        *inner.shutdown.lock().expect("shutdown lock poisoned") = Some(run.clone());

        let me = match inner.call("getMe", &json!({}), None).await {
            Ok(me) => me,
            Err(err) => {
                *inner.shutdown.lock().expect("shutdown lock poisoned") = None;
                return Err(err);
            }
        };
        let me: TgUser = serde_json::from_value(me)?;
        let bot = BotIdentity {
            id: me.id,
            username: me.username.unwrap_or_default(),
        };
        debug!("telegram: connected as @{}", bot.username);

        // Long polling and webhooks are mutually exclusive; clear any
        // stale webhook and discard its backlog.
        inner
            .call("deleteWebhook", &json!({"drop_pending_updates": true}), None)
            .await
            .ok();

        let (update_tx, update_rx) = mpsc::channel::<Update>(inner.workers * 2);
        let update_rx = Arc::new(tokio::sync::Mutex::new(update_rx));
        let mut worker_handles = Vec::with_capacity(inner.workers);
        for _ in 0..inner.workers {
            let inner = inner.clone();
            let bot = bot.clone();
            let rx = update_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let update = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match update {
                        Some(update) => inner.handle_update(&bot, update).await,
                        None => break,
                    }
                }
            }));
        }

        inner.running.store(true, Ordering::SeqCst);
        let mut offset: i64 = 0;
        loop {
            let params = json!({
                "timeout": inner.poll_timeout,
                "offset": offset,
                "allowed_updates": ["message", "edited_message"],
            });
            let poll = tokio::select! {
                () = run.cancelled() => break,
                res = inner.call("getUpdates", &params, None) => res,
            };
            match poll {
                Ok(result) => {
                    let updates: Vec<Update> =
                        serde_json::from_value(result).unwrap_or_default();
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        // Bounded handoff: backpressure from busy workers
                        // slows the poll loop instead of buffering forever.
                        tokio::select! {
                            () = run.cancelled() => break,
                            res = update_tx.send(update) => {
                                if res.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    if run.is_cancelled() {
                        break;
                    }
                    warn!("telegram: getUpdates failed: {}", err);
                    tokio::select! {
                        () = run.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(3)) => {}
                    }
                }
            }
        }

        drop(update_tx);
        for handle in worker_handles {
            let _ = handle.await;
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
        let chat_id = parse_chat_id(&msg.chat_id)?;
        let reply_to = resolve_reply_target(msg);

        let html = send_params(
            &chat_id,
            &markdown_to_telegram_html(content),
            Some("HTML"),
            reply_to,
        );
        match self.inner.send_message_with_retry(&html).await {
            Ok(()) => Ok(()),
            Err(err) if is_parse_entities_error(&err) => {
                // The HTML rendering did not survive Telegram's parser;
                // deliver the original text unchanged.
                let plain = send_params(&chat_id, content, None, reply_to);
                self.inner.send_message_with_retry(&plain).await
            }
            Err(err) => Err(err),
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

struct FileRef {
    id: String,
    name: String,
    mime_type: String,
    kind: Option<AttachmentKind>,
    size: i64,
}

fn sender_id(from: &TgUser) -> String {
    let id = from.id.to_string();
    let username = from
        .username
        .as_deref()
        .unwrap_or("")
        .trim()
        .trim_start_matches('@');
    if username.is_empty() {
        id
    } else {
        format!("{}|{}", id, username)
    }
}

fn message_content(msg: &TgMessage) -> String {
    let text = msg.text.as_deref().unwrap_or("").trim();
    if !text.is_empty() {
        return text.to_string();
    }
    msg.caption.as_deref().unwrap_or("").trim().to_string()
}

/// Remove the first `@botname` mention. Returns `None` when the text
/// carries no mention.
fn strip_mention(text: &str, bot_username: &str) -> Option<String> {
    let bot_username = bot_username.trim().trim_start_matches('@');
    if bot_username.is_empty() {
        return None;
    }
    let re = Regex::new(&format!(r"(?i)@{}\b", regex::escape(bot_username))).ok()?;
    let m = re.find(text)?;
    let mut stripped = String::with_capacity(text.len());
    stripped.push_str(&text[..m.start()]);
    stripped.push_str(&text[m.end()..]);
    Some(stripped.trim().to_string())
}

fn build_delivery(msg: &TgMessage) -> Delivery {
    Delivery {
        message_id: msg.message_id.to_string(),
        reply_to_id: msg
            .reply_to_message
            .as_ref()
            .map(|r| r.message_id.to_string())
            .unwrap_or_default(),
        thread_id: msg
            .message_thread_id
            .filter(|t| *t > 0)
            .map(|t| t.to_string())
            .unwrap_or_default(),
        is_direct: msg.chat.kind == "private",
    }
}

/// Numeric ids stay numeric on the wire; anything else (e.g.
/// `@channelname`) passes through as a string.
fn parse_chat_id(v: &str) -> Result<Value> {
    let v = v.trim();
    if v.is_empty() {
        return Err(anyhow!("chat_id is empty"));
    }
    if let Ok(n) = v.parse::<i64>() {
        return Ok(json!(n));
    }
    Ok(json!(v))
}

fn send_params(
    chat_id: &Value,
    text: &str,
    parse_mode: Option<&str>,
    reply_to: Option<i64>,
) -> Value {
    let mut params = json!({
        "chat_id": chat_id,
        "text": text,
    });
    if let Some(mode) = parse_mode {
        params["parse_mode"] = json!(mode);
    }
    if let Some(message_id) = reply_to {
        params["reply_parameters"] = json!({
            "message_id": message_id,
            "allow_sending_without_reply": true,
        });
    }
    params
}

fn resolve_reply_target(msg: &OutboundMessage) -> Option<i64> {
    msg.reply_target()
        .and_then(|id| id.parse::<i64>().ok())
        .filter(|n| *n > 0)
}

fn is_parse_entities_error(err: &anyhow::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("can't parse entities")
        || (text.contains("parse entities") && text.contains("400"))
}

pub(crate) fn clamp_poll_timeout(v: i64) -> i64 {
    if v <= 0 {
        25
    } else {
        v.min(50)
    }
}

pub(crate) fn clamp_workers(v: i64) -> i64 {
    if v <= 0 {
        2
    } else {
        v.min(8)
    }
}

static RE_LINK: OnceLock<Regex> = OnceLock::new();
static RE_BOLD: OnceLock<Regex> = OnceLock::new();
static RE_ITALIC: OnceLock<Regex> = OnceLock::new();
static RE_CODE: OnceLock<Regex> = OnceLock::new();

/// Translate the markdown subset the agent emits into Telegram HTML.
pub(crate) fn markdown_to_telegram_html(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let re_link = RE_LINK.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());
    let re_bold = RE_BOLD.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
    let re_italic = RE_ITALIC.get_or_init(|| Regex::new(r"(?s)\b_(.+?)_\b").unwrap());
    let re_code = RE_CODE.get_or_init(|| Regex::new(r"`([^`]+)`").unwrap());

    let html = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    let html = re_link.replace_all(&html, r#"<a href="$2">$1</a>"#);
    let html = re_bold.replace_all(&html, "<b>$1</b>");
    let html = re_italic.replace_all(&html, "<i>$1</i>");
    let html = re_code.replace_all(&html, "<code>$1</code>");
    html.into_owned()
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    edited_message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<TgPhotoSize>,
    #[serde(default)]
    audio: Option<TgFileMeta>,
    #[serde(default)]
    voice: Option<TgFileMeta>,
    #[serde(default)]
    video: Option<TgFileMeta>,
    #[serde(default)]
    document: Option<TgFileMeta>,
    #[serde(default)]
    reply_to_message: Option<Box<TgMessage>>,
    #[serde(default)]
    message_thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TgFileMeta {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    #[serde(default)]
    file_path: Option<String>,
}

fn fallback(value: &Option<String>, default: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_clamps() {
        assert_eq!(clamp_poll_timeout(0), 25);
        assert_eq!(clamp_poll_timeout(-3), 25);
        assert_eq!(clamp_poll_timeout(30), 30);
        assert_eq!(clamp_poll_timeout(999), 50);
    }

    #[test]
    fn worker_clamps() {
        assert_eq!(clamp_workers(0), 2);
        assert_eq!(clamp_workers(4), 4);
        assert_eq!(clamp_workers(999), 8);
    }

    #[test]
    fn markdown_to_html_basics() {
        assert_eq!(
            markdown_to_telegram_html("**bold** and `code`"),
            "<b>bold</b> and <code>code</code>"
        );
        assert_eq!(
            markdown_to_telegram_html("[link](https://example.com)"),
            r#"<a href="https://example.com">link</a>"#
        );
        assert_eq!(markdown_to_telegram_html("a < b & c"), "a &lt; b &amp; c");
    }

    #[test]
    fn parse_entities_error_detection() {
        let api_err = anyhow::Error::new(HttpSendError {
            channel: "telegram",
            status: 400,
            retry_after: None,
            body: "Bad Request: can't parse entities".into(),
        });
        assert!(is_parse_entities_error(&api_err));
        assert!(!is_parse_entities_error(&anyhow!("connection reset")));
    }

    #[test]
    fn chat_id_parse_numeric_and_username() {
        assert_eq!(parse_chat_id("123").unwrap(), json!(123));
        assert_eq!(parse_chat_id("@mychannel").unwrap(), json!("@mychannel"));
        assert!(parse_chat_id("  ").is_err());
    }

    #[test]
    fn reply_target_prefers_typed_delivery_id() {
        let msg = OutboundMessage {
            reply_to: "7".into(),
            delivery: Delivery {
                reply_to_id: "9".into(),
                ..Delivery::default()
            },
            ..OutboundMessage::default()
        };
        assert_eq!(resolve_reply_target(&msg), Some(9));

        let legacy = OutboundMessage {
            reply_to: "7".into(),
            ..OutboundMessage::default()
        };
        assert_eq!(resolve_reply_target(&legacy), Some(7));
    }

    #[test]
    fn sender_id_appends_username() {
        let with_name = TgUser {
            id: 42,
            is_bot: false,
            username: Some("alice".into()),
        };
        assert_eq!(sender_id(&with_name), "42|alice");

        let anonymous = TgUser {
            id: 42,
            is_bot: false,
            username: None,
        };
        assert_eq!(sender_id(&anonymous), "42");
    }

    #[test]
    fn mention_stripping() {
        assert_eq!(
            strip_mention("@mybot hello", "mybot"),
            Some("hello".to_string())
        );
        assert_eq!(
            strip_mention("hello @MyBot there", "mybot"),
            Some("hello  there".trim().to_string())
        );
        assert_eq!(strip_mention("hello", "mybot"), None);
    }

    #[test]
    fn delivery_from_update() {
        let raw = r#"{
            "message_id": 10,
            "chat": {"id": 5, "type": "private"},
            "reply_to_message": {"message_id": 8, "chat": {"id": 5, "type": "private"}},
            "message_thread_id": 3
        }"#;
        let msg: TgMessage = serde_json::from_str(raw).unwrap();
        let d = build_delivery(&msg);
        assert_eq!(d.message_id, "10");
        assert_eq!(d.reply_to_id, "8");
        assert_eq!(d.thread_id, "3");
        assert!(d.is_direct);
    }

    #[tokio::test]
    async fn send_falls_back_to_plain_on_parse_error() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // HTML attempt fails with a parse-entities 400.
        Mock::given(method("POST"))
            .and(path("/bottok/sendMessage"))
            .and(body_partial_json(json!({"parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: can't parse entities"
            })))
            .expect(1)
            .mount(&server)
            .await;
        // Plain-text retry delivers the original content unchanged.
        Mock::given(method("POST"))
            .and(path("/bottok/sendMessage"))
            .and(body_partial_json(json!({"text": "_oops <unclosed"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "result": {"message_id": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = TelegramChannel::new(
            TelegramConfig {
                enabled: true,
                token: "tok".into(),
                base_url: server.uri(),
                ..TelegramConfig::default()
            },
            Arc::new(Bus::new(4)),
        );
        let msg = OutboundMessage {
            channel: "telegram".into(),
            chat_id: "5".into(),
            content: "_oops <unclosed".into(),
            ..OutboundMessage::default()
        };
        channel.send(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn send_retries_on_rate_limit() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottok/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 1",
                "parameters": {"retry_after": 1}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bottok/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "result": {"message_id": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = TelegramChannel::new(
            TelegramConfig {
                enabled: true,
                token: "tok".into(),
                base_url: server.uri(),
                ..TelegramConfig::default()
            },
            Arc::new(Bus::new(4)),
        );
        let msg = OutboundMessage {
            channel: "telegram".into(),
            chat_id: "5".into(),
            content: "hello".into(),
            ..OutboundMessage::default()
        };
        let started = std::time::Instant::now();
        channel.send(&msg).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn send_empty_content_is_a_no_op() {
        let channel = TelegramChannel::new(
            TelegramConfig {
                token: "tok".into(),
                ..TelegramConfig::default()
            },
            Arc::new(Bus::new(4)),
        );
        let msg = OutboundMessage {
            channel: "telegram".into(),
            chat_id: "5".into(),
            content: "  ".into(),
            ..OutboundMessage::default()
        };
        channel.send(&msg).await.unwrap();
    }
}
