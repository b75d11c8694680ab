use crate::bus::Bus;
use crate::channels::base::Channel;
use crate::errors::PincerError;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Snapshot of one channel's health as reported by `Manager::status`.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Owns the set of channel adapters: supervises their lifecycles, drains
/// the outbound stream, and records per-channel health.
pub struct Manager {
    bus: Arc<Bus>,
    channels: RwLock<HashMap<&'static str, Arc<dyn Channel>>>,
    last_error: Arc<RwLock<HashMap<String, String>>>,
    running: RwLock<bool>,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            channels: RwLock::new(HashMap::new()),
            last_error: Arc::new(RwLock::new(HashMap::new())),
            running: RwLock::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a channel. Last writer for a given name wins.
    pub fn add(&self, channel: Arc<dyn Channel>) {
        let mut channels = self.channels.write().expect("channels lock poisoned");
        channels.insert(channel.name(), channel);
    }

    /// Look up a channel by name.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Channel>> {
        let channels = self.channels.read().expect("channels lock poisoned");
        channels.get(name).cloned().ok_or_else(|| {
            PincerError::Channel {
                channel: name.to_string(),
                message: "channel not found".into(),
            }
            .into()
        })
    }

    /// Start every registered channel plus the outbound dispatcher.
    /// Idempotent; each channel runs under its own supervision task and
    /// records `last_error` on a non-cancellation exit.
    pub fn start_all(&self, shutdown: &CancellationToken) {
        {
            let mut running = self.running.write().expect("running lock poisoned");
            if *running {
                return;
            }
            *running = true;
        }

        // Chain our own token to the caller's so stop_all works even when
        // the caller never cancels.
        let root = shutdown.child_token();
        let forward = root.clone();
        let own = self.shutdown.clone();
        tokio::spawn(async move {
            own.cancelled().await;
            forward.cancel();
        });

        let channels: Vec<Arc<dyn Channel>> = {
            let map = self.channels.read().expect("channels lock poisoned");
            map.values().cloned().collect()
        };

        for channel in channels {
            let name = channel.name();
            self.set_last_error(name, None);
            let errors = self.last_error.clone();
            let token = root.child_token();
            tokio::spawn(async move {
                info!("channels: starting {}", name);
                match channel.start(token).await {
                    Ok(()) => info!("channels: {} stopped", name),
                    Err(err) => {
                        warn!("channels: {} stopped with error: {}", name, err);
                        let mut map = errors.write().expect("error lock poisoned");
                        map.insert(name.to_string(), err.to_string());
                    }
                }
            });
        }

        self.spawn_outbound_dispatcher(root);
    }

    /// Stop every channel. Idempotent; stop errors are recorded.
    pub async fn stop_all(&self) {
        {
            let mut running = self.running.write().expect("running lock poisoned");
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown.cancel();

        let channels: Vec<Arc<dyn Channel>> = {
            let map = self.channels.read().expect("channels lock poisoned");
            map.values().cloned().collect()
        };
        for channel in channels {
            if let Err(err) = channel.stop().await {
                warn!("channels: failed to stop {}: {}", channel.name(), err);
                self.set_last_error(channel.name(), Some(err.to_string()));
            }
        }
    }

    /// Snapshot of every channel's running flag and last error.
    pub fn status(&self) -> HashMap<String, ChannelStatus> {
        let channels = self.channels.read().expect("channels lock poisoned");
        let errors = self.last_error.read().expect("error lock poisoned");
        channels
            .iter()
            .map(|(name, ch)| {
                (
                    (*name).to_string(),
                    ChannelStatus {
                        running: ch.is_running(),
                        last_error: errors.get(*name).cloned(),
                    },
                )
            })
            .collect()
    }

    /// Single dispatcher task: drain outbound and hand each message to the
    /// adapter named on it. Unknown channels are dropped with a log; send
    /// errors are recorded and the loop continues.
    fn spawn_outbound_dispatcher(&self, token: CancellationToken) {
        let bus = self.bus.clone();
        let errors = self.last_error.clone();
        let channels: Vec<Arc<dyn Channel>> = {
            let map = self.channels.read().expect("channels lock poisoned");
            map.values().cloned().collect()
        };
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = token.cancelled() => break,
                    msg = bus.consume_outbound() => match msg {
                        Ok(msg) => msg,
                        Err(_) => break,
                    },
                };

                let Some(channel) = channels.iter().find(|c| c.name() == msg.channel) else {
                    warn!("channels: dropping outbound for unknown channel {}", msg.channel);
                    continue;
                };

                if let Err(err) = channel.send(&msg).await {
                    warn!("channels: outbound send failed via {}: {}", msg.channel, err);
                    let mut map = errors.write().expect("error lock poisoned");
                    map.insert(msg.channel.clone(), err.to_string());
                }
            }
        });
    }

    fn set_last_error(&self, name: &str, value: Option<String>) {
        let mut map = self.last_error.write().expect("error lock poisoned");
        match value {
            Some(v) => {
                map.insert(name.to_string(), v);
            }
            None => {
                map.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::OutboundMessage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubChannel {
        name: &'static str,
        start_err: Option<String>,
        send_err: Option<String>,
        running: AtomicBool,
        sends: AtomicUsize,
    }

    impl StubChannel {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                start_err: None,
                send_err: None,
                running: AtomicBool::new(false),
                sends: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Channel for StubChannel {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self, shutdown: CancellationToken) -> Result<()> {
            if let Some(msg) = &self.start_err {
                return Err(anyhow!("{}", msg));
            }
            self.running.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, _msg: &OutboundMessage) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            match &self.send_err {
                Some(msg) => Err(anyhow!("{}", msg)),
                None => Ok(()),
            }
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn outbound(channel: &str) -> OutboundMessage {
        OutboundMessage {
            channel: channel.into(),
            chat_id: "c1".into(),
            content: "hello".into(),
            ..OutboundMessage::default()
        }
    }

    #[tokio::test]
    async fn start_all_records_start_error() {
        let bus = Arc::new(Bus::new(16));
        let manager = Manager::new(bus);
        let mut stub = StubChannel::new("stub");
        stub.start_err = Some("start failed".into());
        manager.add(Arc::new(stub));

        let token = CancellationToken::new();
        manager.start_all(&token);

        wait_for(|| {
            manager
                .status()
                .get("stub")
                .and_then(|s| s.last_error.clone())
                .is_some()
        })
        .await;
        token.cancel();
    }

    #[tokio::test]
    async fn dispatcher_records_send_error() {
        let bus = Arc::new(Bus::new(16));
        let manager = Manager::new(bus.clone());
        let mut stub = StubChannel::new("stub");
        stub.send_err = Some("send failed".into());
        manager.add(Arc::new(stub));

        let token = CancellationToken::new();
        manager.start_all(&token);
        bus.publish_outbound(outbound("stub")).await.unwrap();

        wait_for(|| {
            manager
                .status()
                .get("stub")
                .and_then(|s| s.last_error.clone())
                .as_deref()
                == Some("send failed")
        })
        .await;
        token.cancel();
    }

    #[tokio::test]
    async fn dispatcher_drops_unknown_channel_without_recording() {
        let bus = Arc::new(Bus::new(16));
        let manager = Manager::new(bus.clone());
        let stub = Arc::new(StubChannel::new("stub"));
        manager.add(stub.clone());

        let token = CancellationToken::new();
        manager.start_all(&token);

        bus.publish_outbound(outbound("nope")).await.unwrap();
        bus.publish_outbound(outbound("stub")).await.unwrap();

        // The second message reaching the stub proves the first was
        // consumed (FIFO) and dropped rather than wedging the dispatcher.
        wait_for(|| stub.sends.load(Ordering::SeqCst) == 1).await;

        let status = manager.status();
        assert!(!status.contains_key("nope"));
        assert!(status.get("stub").unwrap().last_error.is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn require_unknown_channel_errors() {
        let manager = Manager::new(Arc::new(Bus::new(16)));
        let err = manager.require("missing").unwrap_err();
        assert!(err.to_string().contains("channel not found"));
    }

    #[tokio::test]
    async fn stop_all_clears_running_and_is_idempotent() {
        let bus = Arc::new(Bus::new(16));
        let manager = Manager::new(bus);
        let stub = Arc::new(StubChannel::new("stub"));
        manager.add(stub.clone());

        let token = CancellationToken::new();
        manager.start_all(&token);
        wait_for(|| stub.is_running()).await;

        manager.stop_all().await;
        manager.stop_all().await;
        wait_for(|| !stub.is_running()).await;
        assert!(!manager.status().get("stub").unwrap().running);
    }
}
