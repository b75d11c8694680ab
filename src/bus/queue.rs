use crate::bus::{InboundMessage, OutboundMessage};
use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// In-process bounded pub/sub with two typed streams: inbound (channel
/// adapters → agent) and outbound (agent → channel manager).
///
/// Each stream is a bounded FIFO. A full queue blocks the publisher —
/// that is the backpressure signal that downstream is slower than
/// upstream. Publishers that must not stall (adapter I/O loops) wrap the
/// publish in `tokio::time::timeout`; a timed-out publish never enqueues
/// the message.
///
/// One consumer per stream. The receiver halves sit behind async mutexes
/// so `&self` consumption works from a single dispatcher/agent task.
pub struct Bus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl Bus {
    /// Create a bus whose streams each hold at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    /// Enqueue an inbound message, waiting for space.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        let (channel, sender_id) = (msg.channel.clone(), msg.sender_id.clone());
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("inbound stream closed"))?;
        debug!("bus: inbound queued channel={} sender={}", channel, sender_id);
        Ok(())
    }

    /// Enqueue an outbound message, waiting for space.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        let (channel, chat_id) = (msg.channel.clone(), msg.chat_id.clone());
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("outbound stream closed"))?;
        debug!("bus: outbound queued channel={} chat_id={}", channel, chat_id);
        Ok(())
    }

    /// Dequeue one inbound message, waiting until one arrives.
    /// Cancel-safe: dropping the future consumes nothing.
    pub async fn consume_inbound(&self) -> Result<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| anyhow!("inbound stream closed"))
    }

    /// Dequeue one outbound message, waiting until one arrives.
    pub async fn consume_outbound(&self) -> Result<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow!("outbound stream closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delivery;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "test".into(),
            sender_id: "u1".into(),
            chat_id: "c1".into(),
            content: content.into(),
            attachments: vec![],
            session_key: "test:c1".into(),
            delivery: Delivery::default(),
            timestamp: Utc::now(),
        }
    }

    fn outbound(channel: &str, content: &str) -> OutboundMessage {
        OutboundMessage {
            channel: channel.into(),
            chat_id: "c1".into(),
            content: content.into(),
            ..OutboundMessage::default()
        }
    }

    #[tokio::test]
    async fn inbound_is_fifo_for_a_single_producer() {
        let bus = Bus::new(16);
        for i in 0..5 {
            bus.publish_inbound(inbound(&format!("m{}", i))).await.unwrap();
        }
        for i in 0..5 {
            let got = bus.consume_inbound().await.unwrap();
            assert_eq!(got.content, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn full_queue_blocks_publisher_until_deadline() {
        let bus = Bus::new(1);
        bus.publish_inbound(inbound("first")).await.unwrap();

        // Queue is full; a deadline-bounded publish must give up without
        // enqueueing anything.
        let publish = timeout(Duration::from_millis(50), bus.publish_inbound(inbound("second")));
        assert!(publish.await.is_err(), "publish should hit the deadline");

        let got = bus.consume_inbound().await.unwrap();
        assert_eq!(got.content, "first");

        // The timed-out message was never enqueued.
        let empty = timeout(Duration::from_millis(50), bus.consume_inbound()).await;
        assert!(empty.is_err(), "queue should be empty");
    }

    #[tokio::test]
    async fn outbound_preserves_publish_order_per_channel() {
        let bus = Bus::new(16);
        bus.publish_outbound(outbound("slack", "a")).await.unwrap();
        bus.publish_outbound(outbound("slack", "b")).await.unwrap();

        assert_eq!(bus.consume_outbound().await.unwrap().content, "a");
        assert_eq!(bus.consume_outbound().await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn concurrent_producers_interleave_without_loss() {
        let bus = std::sync::Arc::new(Bus::new(4));
        let mut handles = Vec::new();
        for p in 0..4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    bus.publish_inbound(inbound(&format!("{}:{}", p, i)))
                        .await
                        .unwrap();
                }
            }));
        }

        let mut per_producer = vec![Vec::new(); 4];
        for _ in 0..40 {
            let msg = bus.consume_inbound().await.unwrap();
            let (p, i) = msg.content.split_once(':').unwrap();
            per_producer[p.parse::<usize>().unwrap()].push(i.parse::<u32>().unwrap());
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Each producer's sequence must arrive in order (prefix-preserving
        // interleaving), with nothing duplicated or dropped.
        for seq in per_producer {
            assert_eq!(seq, (0..10).collect::<Vec<_>>());
        }
    }
}
