use crate::bus::{Attachment, AttachmentKind, Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::base::{
    send_backoff, AllowList, Channel, GroupPolicy, INBOUND_PUBLISH_TIMEOUT, MAX_SEND_ATTEMPTS,
};
use crate::config::DiscordConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serenity::async_trait as serenity_async_trait;
use serenity::builder::{CreateAllowedMentions, CreateMessage};
use serenity::model::channel::{Message as DiscordMessage, MessageReference};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::id::{ChannelId, MessageId};
use serenity::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Discord gateway adapter built on serenity. The gateway session feeds
/// inbound events; sends go through the REST API.
pub struct DiscordChannel {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: DiscordConfig,
    bus: Arc<Bus>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    http: Mutex<Option<Arc<serenity::http::Http>>>,
}

struct Handler {
    bus: Arc<Bus>,
    allow: AllowList,
    group_policy: GroupPolicy,
    group_allow_from: Vec<String>,
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            "discord: connected as {} ({})",
            ready.user.name, ready.user.id
        );
    }

    async fn message(&self, ctx: Context, msg: DiscordMessage) {
        if msg.author.bot {
            return;
        }
        let sender_id = msg.author.id.to_string();
        if !self.allow.allowed(&sender_id) {
            return;
        }

        let bot_id = ctx.cache.current_user().id;
        let is_direct = msg.guild_id.is_none();
        let mentioned = msg.mentions.iter().any(|u| u.id == bot_id);
        let chat_id = msg.channel_id.to_string();
        if !admits(
            self.group_policy,
            &self.group_allow_from,
            is_direct,
            &chat_id,
            mentioned,
        ) {
            return;
        }

        let content = strip_bot_mention(&msg.content, bot_id.get());
        let attachments = inbound_attachments(&msg);
        if content.is_empty() && attachments.is_empty() {
            return;
        }

        let inbound = InboundMessage {
            channel: "discord".into(),
            sender_id,
            session_key: InboundMessage::session_key("discord", &chat_id),
            chat_id,
            content,
            attachments,
            delivery: build_delivery(&msg),
            timestamp: Utc::now(),
        };
        if tokio::time::timeout(INBOUND_PUBLISH_TIMEOUT, self.bus.publish_inbound(inbound))
            .await
            .is_err()
        {
            warn!("discord: inbound publish timed out, dropping message");
        }
    }
}

impl DiscordChannel {
    pub fn new(cfg: DiscordConfig, bus: Arc<Bus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                bus,
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                http: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = self.inner.clone();
        let token = inner.cfg.token.trim().to_string();
        if token.is_empty() {
            return Err(anyhow!("discord token is empty"));
        }

        let run = shutdown.child_token();
        *inner.shutdown.lock().expect("shutdown lock poisoned") = Some(run.clone());

        let intents = if inner.cfg.intents == 0 {
            GatewayIntents::GUILD_MESSAGES
                | GatewayIntents::DIRECT_MESSAGES
                | GatewayIntents::MESSAGE_CONTENT
        } else {
            GatewayIntents::from_bits_truncate(inner.cfg.intents)
        };

        let handler = Handler {
            bus: inner.bus.clone(),
            allow: AllowList::new(inner.cfg.allow_from.clone()),
            group_policy: inner.cfg.group_policy,
            group_allow_from: inner.cfg.group_allow_from.clone(),
        };

        let mut client = serenity::Client::builder(&token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| anyhow!("failed to build discord client: {}", e))?;
        *inner.http.lock().expect("http lock poisoned") = Some(client.http.clone());
        let shard_manager = client.shard_manager.clone();

        inner.running.store(true, Ordering::SeqCst);
        let mut gateway = tokio::spawn(async move { client.start().await });

        let result = tokio::select! {
            res = &mut gateway => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(anyhow!("discord gateway error: {}", err)),
                Err(err) => Err(anyhow!("discord gateway task failed: {}", err)),
            },
            () = run.cancelled() => {
                shard_manager.shutdown_all().await;
                let _ = gateway.await;
                Ok(())
            }
        };

        inner.running.store(false, Ordering::SeqCst);
        *inner.http.lock().expect("http lock poisoned") = None;
        *inner.shutdown.lock().expect("shutdown lock poisoned") = None;
        result
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
        let chat_id = msg
            .chat_id
            .trim()
            .parse::<u64>()
            .map_err(|_| anyhow!("invalid discord chat_id: {}", msg.chat_id))?;

        let http = {
            let guard = self.inner.http.lock().expect("http lock poisoned");
            guard.clone()
        }
        .ok_or_else(|| anyhow!("discord not connected"))?;

        let channel = ChannelId::new(chat_id);
        let reply_to = msg.reply_target().and_then(|id| id.parse::<u64>().ok());

        let mut attempt = 1;
        loop {
            let mut builder = CreateMessage::new().content(content);
            if let Some(reply_id) = reply_to {
                builder = builder
                    .reference_message(MessageReference::from((
                        channel,
                        MessageId::new(reply_id),
                    )))
                    .allowed_mentions(CreateAllowedMentions::new().replied_user(false));
            }
            match channel.send_message(&http, builder).await {
                Ok(_) => return Ok(()),
                Err(err) => match retry_for_status(error_status(&err), attempt) {
                    Some(wait) if attempt < MAX_SEND_ATTEMPTS => {
                        warn!(
                            "discord: send failed ({}/{}), retry in {:?}: {}",
                            attempt, MAX_SEND_ATTEMPTS, wait, err
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                    _ => return Err(anyhow!("discord send error: {}", err)),
                },
            }
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// Group admission. DMs always pass; mention policy requires the bot to
/// appear in the message's mention list.
fn admits(
    policy: GroupPolicy,
    group_allow: &[String],
    is_direct: bool,
    channel_id: &str,
    mentioned: bool,
) -> bool {
    if is_direct {
        return true;
    }
    match policy {
        GroupPolicy::Open => true,
        GroupPolicy::Allowlist => group_allow.iter().any(|c| c.trim() == channel_id),
        GroupPolicy::Mention => mentioned,
    }
}

/// Drop `<@id>` / `<@!id>` bot mentions from the text.
fn strip_bot_mention(content: &str, bot_id: u64) -> String {
    content
        .replace(&format!("<@{}>", bot_id), "")
        .replace(&format!("<@!{}>", bot_id), "")
        .trim()
        .to_string()
}

fn build_delivery(msg: &DiscordMessage) -> Delivery {
    let mut reply_to_id = msg
        .message_reference
        .as_ref()
        .and_then(|r| r.message_id)
        .map(|id| id.to_string())
        .unwrap_or_default();
    if reply_to_id.is_empty() {
        if let Some(referenced) = &msg.referenced_message {
            reply_to_id = referenced.id.to_string();
        }
    }
    Delivery {
        message_id: msg.id.to_string(),
        reply_to_id,
        thread_id: String::new(),
        is_direct: msg.guild_id.is_none(),
    }
}

fn inbound_attachments(msg: &DiscordMessage) -> Vec<Attachment> {
    msg.attachments
        .iter()
        .map(|a| {
            let mime_type = a.content_type.clone().unwrap_or_default();
            Attachment {
                id: a.id.to_string(),
                name: a.filename.clone(),
                kind: AttachmentKind::from_mime(&mime_type),
                mime_type,
                size_bytes: i64::from(a.size),
                url: a.url.clone(),
                headers: std::collections::HashMap::new(),
            }
        })
        .collect()
}

fn error_status(err: &serenity::Error) -> Option<u16> {
    if let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(resp)) = err {
        return Some(resp.status_code.as_u16());
    }
    None
}

/// serenity retries 429s internally; this is the safety net on top,
/// mirroring the other adapters' policy.
fn retry_for_status(status: Option<u16>, attempt: u32) -> Option<Duration> {
    match status {
        Some(429) => Some(send_backoff(attempt)),
        Some(code) if (500..=599).contains(&code) => Some(send_backoff(attempt)),
        _ => None,
    }
}
