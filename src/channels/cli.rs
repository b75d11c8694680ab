use crate::bus::{Bus, Delivery, InboundMessage, OutboundMessage};
use crate::channels::base::Channel;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Terminal adapter: stdin lines become inbound messages, outbound
/// replies print to stdout. No retries, no allowlist.
pub struct CliChannel {
    bus: Arc<Bus>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl CliChannel {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let run = shutdown.child_token();
        *self.shutdown.lock().expect("shutdown lock poisoned") = Some(run.clone());
        self.running.store(true, Ordering::SeqCst);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                () = run.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let content = line.trim().to_string();
                    if content.is_empty() {
                        continue;
                    }
                    let msg = InboundMessage {
                        channel: "cli".into(),
                        sender_id: "local".into(),
                        chat_id: "direct".into(),
                        content,
                        attachments: vec![],
                        session_key: InboundMessage::session_key("cli", "direct"),
                        delivery: Delivery {
                            is_direct: true,
                            ..Delivery::default()
                        },
                        timestamp: Utc::now(),
                    };
                    if self.bus.publish_inbound(msg).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break, // stdin closed
            }
        }

        self.running.store(false, Ordering::SeqCst);
        *self.shutdown.lock().expect("shutdown lock poisoned") = None;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let token = self.shutdown.lock().expect("shutdown lock poisoned").take();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let content = msg.content.trim();
        if !content.is_empty() {
            println!("{}", content);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
