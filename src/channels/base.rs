use crate::bus::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deadline for publishing an inbound message onto the bus. Bounds how
/// long a saturated bus can stall a provider's own I/O loop.
pub const INBOUND_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum delivery attempts on the send path, shared by all adapters.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// The capability surface every channel adapter exposes to the manager.
/// Adapters own their vendor SDKs; the manager never touches vendor types.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable identifier, also the routing key on outbound messages.
    fn name(&self) -> &'static str;

    /// Run the adapter until `shutdown` fires or a fatal error occurs.
    /// Cancellation is a clean exit (`Ok`); errors are fatal and recorded
    /// by the manager.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Request graceful termination. Idempotent; makes a concurrent
    /// `start` return promptly.
    async fn stop(&self) -> Result<()>;

    /// Deliver one reply. Empty trimmed content is a successful no-op.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Best-effort liveness, safe to call from any task.
    fn is_running(&self) -> bool;
}

impl std::fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("name", &self.name()).finish()
    }
}

/// Sender ids admitted on a channel. Empty list admits everyone.
///
/// Adapters may enrich sender ids to `"{id}|{username}"`; either part
/// matches. Leading `+` (phone number formatting) is ignored on both
/// sides.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    pub allow_from: Vec<String>,
}

impl AllowList {
    pub fn new(allow_from: Vec<String>) -> Self {
        Self { allow_from }
    }

    pub fn allowed(&self, sender_id: &str) -> bool {
        if self.allow_from.is_empty() {
            return true;
        }
        let normalized: Vec<&str> = self
            .allow_from
            .iter()
            .map(|a| a.trim().trim_start_matches('+'))
            .collect();
        sender_id
            .split('|')
            .map(|part| part.trim_start_matches('+'))
            .filter(|part| !part.is_empty())
            .any(|part| normalized.contains(&part))
    }
}

/// Admission policy for group-chat messages. DMs and MPIMs are always
/// admitted regardless of policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Admit everything.
    #[default]
    Open,
    /// Admit only chats on the group allowlist.
    Allowlist,
    /// Admit only messages that mention the bot. Platforms that emit both
    /// a plain message and a mention event for the same utterance must
    /// admit only the mention variant.
    Mention,
}

/// Backoff schedule for send retries: 300 ms × 2^min(attempt-1, 4).
pub fn send_backoff(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let shift = (attempt - 1).min(4);
    Duration::from_millis(300) * (1u32 << shift)
}

/// HTTP-level failure on an adapter send path, carrying what the retry
/// classifier needs.
#[derive(Debug, thiserror::Error)]
#[error("{channel} send status {status}: {body}")]
pub struct HttpSendError {
    pub channel: &'static str,
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// Decide whether a failed send should be retried, and how long to wait.
///
/// Retryable: vendor rate limits (honoring a carried `Retry-After`),
/// 5xx responses, and transient transport errors (timeout/connect).
/// Everything else — other 4xx, parse errors — is fatal.
pub fn send_retry_delay(err: &anyhow::Error, attempt: u32) -> Option<Duration> {
    if let Some(http) = err.downcast_ref::<HttpSendError>() {
        if http.status == 429 {
            return Some(http.retry_after.unwrap_or_else(|| send_backoff(attempt)));
        }
        if (500..=599).contains(&http.status) {
            return Some(send_backoff(attempt));
        }
        return None;
    }
    if let Some(req) = err.downcast_ref::<reqwest::Error>() {
        if req.is_timeout() || req.is_connect() {
            return Some(send_backoff(attempt));
        }
    }
    None
}

/// Parse a `Retry-After` header value: integer seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let until = at.signed_duration_since(chrono::Utc::now());
    until.to_std().ok()
}

/// Delay before reconnecting a dropped vendor socket, with jitter to
/// avoid thundering herds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base = 5u64.saturating_mul(1 << attempt.min(4)).min(60);
    let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
    Duration::from_secs(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_empty_admits_everyone() {
        let allow = AllowList::default();
        assert!(allow.allowed("anyone"));
    }

    #[test]
    fn allow_list_matches_either_part_of_enriched_id() {
        let allow = AllowList::new(vec!["12345".into()]);
        assert!(allow.allowed("12345"));
        assert!(allow.allowed("12345|alice"));
        assert!(!allow.allowed("67890|bob"));

        let by_name = AllowList::new(vec!["alice".into()]);
        assert!(by_name.allowed("12345|alice"));
    }

    #[test]
    fn allow_list_ignores_plus_prefix() {
        let allow = AllowList::new(vec!["+15551234567".into()]);
        assert!(allow.allowed("15551234567"));
        assert!(allow.allowed("+15551234567"));
    }

    #[test]
    fn send_backoff_schedule() {
        assert_eq!(send_backoff(1), Duration::from_millis(300));
        assert_eq!(send_backoff(2), Duration::from_millis(600));
        assert_eq!(send_backoff(3), Duration::from_millis(1200));
        assert_eq!(send_backoff(5), Duration::from_millis(4800));
        // Shift is capped at 4.
        assert_eq!(send_backoff(9), Duration::from_millis(4800));
        // Attempt 0 is clamped up.
        assert_eq!(send_backoff(0), Duration::from_millis(300));
    }

    #[test]
    fn retry_on_429_honors_retry_after() {
        let err = anyhow::Error::new(HttpSendError {
            channel: "whatsapp",
            status: 429,
            retry_after: Some(Duration::from_secs(2)),
            body: String::new(),
        });
        assert_eq!(send_retry_delay(&err, 1), Some(Duration::from_secs(2)));
    }

    #[test]
    fn retry_on_429_without_header_uses_backoff() {
        let err = anyhow::Error::new(HttpSendError {
            channel: "whatsapp",
            status: 429,
            retry_after: None,
            body: String::new(),
        });
        assert_eq!(send_retry_delay(&err, 1), Some(Duration::from_millis(300)));
    }

    #[test]
    fn retry_on_5xx_no_retry_on_4xx() {
        let server_err = anyhow::Error::new(HttpSendError {
            channel: "telegram",
            status: 502,
            retry_after: None,
            body: String::new(),
        });
        assert!(send_retry_delay(&server_err, 1).is_some());

        let client_err = anyhow::Error::new(HttpSendError {
            channel: "telegram",
            status: 400,
            retry_after: None,
            body: String::new(),
        });
        assert!(send_retry_delay(&client_err, 1).is_none());
    }

    #[test]
    fn no_retry_on_plain_errors() {
        let err = anyhow::anyhow!("chat_id is empty");
        assert!(send_retry_delay(&err, 1).is_none());
    }

    #[test]
    fn parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
    }
}
