//! Test utilities: a scriptable in-process broker
//!
//! [`MockBroker`] stands in for an MQTT broker behind the
//! [`Connector`]/[`Session`] seam. Tests can take it offline, delay or fail
//! connects, fail a specific publish attempt, inject inbound messages and
//! drop the connection.
//!
//! ```rust,ignore
//! let broker = MockBroker::new();
//! let link = LinkManager::new(LinkConfig::default(), broker.connector());
//! broker.set_online(false);
//! link.publish("t", Bytes::from_static(b"x")).await?; // buffered
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::link::{Connector, EventSink, MessageHandler, Session};

pub use crate::storage::MemoryStorage;

/// A message the mock broker accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic
    pub topic: String,
    /// Payload
    pub payload: Bytes,
    /// Retain flag
    pub retain: bool,
}

#[derive(Default)]
struct BrokerState {
    online: AtomicBool,
    connect_failures: AtomicUsize,
    connect_delay: Mutex<Duration>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    publish_attempts: AtomicUsize,
    failing_attempts: Mutex<HashSet<usize>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    sinks: Mutex<Vec<EventSink>>,
}

/// Scriptable in-process broker
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create an online broker
    pub fn new() -> Self {
        let state = BrokerState::default();
        state.online.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Connector that opens sessions on this broker
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    /// Take the broker up or down; down fails connects and publishes
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next `count` connect attempts
    pub fn fail_connects(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every connect by `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Reject the `n`th publish attempt (1-based, counted from now on)
    pub fn fail_publish_attempt(&self, n: usize) {
        let base = self.state.publish_attempts.load(Ordering::SeqCst);
        self.state.failing_attempts.lock().insert(base + n);
    }

    /// Deliver an inbound message on the newest connection
    pub fn inject(&self, topic: &str, payload: Bytes) -> bool {
        match self.state.sinks.lock().last() {
            Some(sink) => sink.message(topic, payload),
            None => false,
        }
    }

    /// Drop the newest connection
    pub fn drop_connection(&self, reason: &str) -> bool {
        match self.state.sinks.lock().last() {
            Some(sink) => sink.disconnected(reason),
            None => false,
        }
    }

    /// Report a disconnect from the connection opened `index`th (0-based)
    pub fn drop_connection_at(&self, index: usize, reason: &str) -> bool {
        match self.state.sinks.lock().get(index) {
            Some(sink) => sink.disconnected(reason),
            None => false,
        }
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Session disconnects so far
    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Accepted publishes in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Accepted payloads in order
    pub fn published_payloads(&self) -> Vec<Bytes> {
        self.state
            .published
            .lock()
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Topics subscribed by the newest connection
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }
}

struct MockConnector {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &LinkConfig, events: EventSink) -> Result<Arc<dyn Session>> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.state.online.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectFailed("connection refused".to_string()));
        }
        let should_fail = self
            .state
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LinkError::ConnectFailed("not authorized".to_string()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.subscriptions.lock().clear();
        self.state.sinks.lock().push(events);
        Ok(Arc::new(MockSession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        if !self.state.online.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }
        self.state.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        let attempt = self.state.publish_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.closed.load(Ordering::SeqCst) || !self.state.online.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }
        if self.state.failing_attempts.lock().remove(&attempt) {
            return Err(LinkError::PublishRejected { code: 0x87 });
        }
        self.state.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Handler that records every message it receives
#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<(String, Bytes)>>,
}

impl RecordingHandler {
    /// Received payloads in order
    pub fn payloads(&self) -> Vec<Bytes> {
        self.received.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Number of received messages
    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        self.received.lock().push((topic.to_string(), payload));
        Ok(())
    }
}
