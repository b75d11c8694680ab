use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transport-level identifiers carried alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub reply_to_id: String,
    #[serde(default)]
    pub thread_id: String,
    /// True for DMs, IMs and private chats.
    #[serde(default)]
    pub is_direct: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
    #[default]
    Other,
}

impl AttachmentKind {
    /// Infer the kind from a MIME type prefix.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.starts_with("video/") {
            Self::Video
        } else {
            Self::Document
        }
    }
}

/// A file carried on an inbound message. The `url` may require the
/// `headers` (e.g. a bearer token) to fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// One user utterance received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Conversation identity for the agent, `"{channel}:{chat_id}"` by convention.
    pub session_key: String,
    #[serde(default)]
    pub delivery: Delivery,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn session_key(channel: &str, chat_id: &str) -> String {
        format!("{}:{}", channel, chat_id)
    }
}

/// One reply to enqueue for delivery back to a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Legacy string id of the message being replied to.
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub delivery: Delivery,
}

impl OutboundMessage {
    /// The message id a reply should target. The typed delivery field wins
    /// over the legacy `reply_to`.
    pub fn reply_target(&self) -> Option<&str> {
        for candidate in [self.delivery.reply_to_id.trim(), self.reply_to.trim()] {
            if !candidate.is_empty() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_convention() {
        assert_eq!(InboundMessage::session_key("slack", "C1"), "slack:C1");
    }

    #[test]
    fn attachment_kind_from_mime() {
        assert_eq!(AttachmentKind::from_mime("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("audio/ogg"), AttachmentKind::Audio);
        assert_eq!(AttachmentKind::from_mime("video/mp4"), AttachmentKind::Video);
        assert_eq!(
            AttachmentKind::from_mime("application/pdf"),
            AttachmentKind::Document
        );
        assert_eq!(
            AttachmentKind::from_mime("text/plain"),
            AttachmentKind::Document
        );
    }

    #[test]
    fn reply_target_prefers_typed_delivery() {
        let msg = OutboundMessage {
            reply_to: "legacy".into(),
            delivery: Delivery {
                reply_to_id: "typed".into(),
                ..Delivery::default()
            },
            ..OutboundMessage::default()
        };
        assert_eq!(msg.reply_target(), Some("typed"));
    }

    #[test]
    fn reply_target_falls_back_to_legacy() {
        let msg = OutboundMessage {
            reply_to: "legacy".into(),
            ..OutboundMessage::default()
        };
        assert_eq!(msg.reply_target(), Some("legacy"));
    }

    #[test]
    fn reply_target_empty_when_unset() {
        let msg = OutboundMessage::default();
        assert_eq!(msg.reply_target(), None);
    }
}
