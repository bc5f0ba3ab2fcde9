//! In-process bus for tests and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{GatewayError, Result};
use crate::message::InboundMessage;
use crate::topics::{topic_matches, validate_publish_topic};
use crate::BusGateway;

/// A message accepted by [`MemoryBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub at: Instant,
}

struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

/// [`BusGateway`] that keeps everything in memory.
///
/// Publishes are recorded in order and copied to every subscriber whose
/// filter matches. The connection flag can be toggled to exercise degraded
/// mode; while disconnected, publishes fail and nothing is recorded.
pub struct MemoryBus {
    connected: AtomicBool,
    published: Mutex<Vec<PublishedMessage>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        tracing::debug!("Memory bus connected: {}", connected);
    }

    /// Receive copies of publishes whose topic matches `pattern`.
    pub fn subscribe(&self, pattern: impl Into<String>) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            pattern: pattern.into(),
            sender,
        });
        receiver
    }

    /// Everything published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Payloads published to one topic, oldest first.
    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.payload.clone())
            .collect()
    }

    /// `(topic, payload)` pairs in publish order.
    pub fn history(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .iter()
            .map(|message| (message.topic.clone(), message.payload.clone()))
            .collect()
    }

    /// Drain the record.
    pub fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusGateway for MemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        validate_publish_topic(topic).map_err(|reason| GatewayError::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        })?;

        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            at: Instant::now(),
        });

        let message = InboundMessage::new(topic, payload);
        self.subscribers.lock().retain(|subscriber| {
            if !topic_matches(&subscriber.pattern, topic) {
                return !subscriber.sender.is_closed();
            }
            subscriber.sender.send(message.clone()).is_ok()
        });

        tracing::trace!("Memory bus publish: {} = {}", topic, payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
