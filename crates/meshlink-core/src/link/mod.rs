//! MQTT link management
//!
//! [`LinkManager`] owns the single broker connection of a process. It
//! connects lazily, serializes connect attempts behind a gate, buffers
//! publishes while the broker is unreachable and flushes them in order once
//! the link is back. Inbound messages are routed to exactly one handler by
//! literal topic.
//!
//! The broker client sits behind the [`Connector`]/[`Session`] traits;
//! [`mqtt::MqttConnector`] is the rumqttc implementation.
//!
//! # Reconnection
//!
//! One of two strategies owns reconnection:
//!
//! - a delayed reconnect scheduled from the disconnect notification
//!   (`reconnect_on_disconnect`), used by the subscribing gateway together
//!   with [`LinkManager::connect_in_background`] for the first connect
//! - a background loop ([`LinkManager::spawn_reconnect_loop`]) that retries
//!   with a linear backoff and flushes the buffer, used by the
//!   publish-only ingest process
//!
//! Once the loop runs, disconnect notifications only mark the link down.
//!
//! Every connection carries a generation number. A disconnect notification
//! from an older connection never marks the current one down.

pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::dispatcher::{MessageSink, QueuedMessage};
use crate::error::{LinkError, Result};
use crate::scheduler::Scheduler;

/// Event reported by a broker session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Message received on a subscribed topic
    Message {
        /// Topic the message arrived on
        topic: String,
        /// Raw payload
        payload: Bytes,
    },
    /// The connection is gone
    Disconnected {
        /// Human readable cause
        reason: String,
    },
}

/// Channel a session reports its events through
///
/// Events are tagged with the generation of the connection that produced
/// them.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    /// Generation of the connection this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an inbound message; `false` once the manager is gone
    pub fn message(&self, topic: impl Into<String>, payload: Bytes) -> bool {
        self.tx
            .send((
                self.generation,
                TransportEvent::Message {
                    topic: topic.into(),
                    payload,
                },
            ))
            .is_ok()
    }

    /// Report the loss of the connection
    pub fn disconnected(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send((
                self.generation,
                TransportEvent::Disconnected {
                    reason: reason.into(),
                },
            ))
            .is_ok()
    }
}

/// Opens broker sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect with `config` and report session events to `events`
    ///
    /// Returns once the broker has accepted the connection.
    async fn connect(&self, config: &LinkConfig, events: EventSink) -> Result<Arc<dyn Session>>;
}

/// An open broker session
#[async_trait]
pub trait Session: Send + Sync {
    /// Subscribe at QoS 1
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publish at QoS 1
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;

    /// Close the session
    async fn disconnect(&self) -> Result<()>;
}

/// Handler for messages on one topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message; errors are logged by the caller
    async fn handle(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// Connection state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No usable connection
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Connected and subscribed
    Connected,
}

/// What happened to a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the broker
    Sent,
    /// Kept in the pending buffer for a later flush
    Buffered,
}

/// Link statistics
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    /// Messages published directly
    pub sent: u64,
    /// Messages put into the pending buffer
    pub buffered: u64,
    /// Buffered messages published by a flush
    pub flushed: u64,
    /// Connect attempts
    pub connect_attempts: u64,
    /// Failed connect attempts
    pub connect_failures: u64,
    /// Disconnect notifications for the current connection
    pub disconnects: u64,
    /// Inbound messages routed to a handler
    pub messages_routed: u64,
    /// Inbound messages without a handler
    pub messages_unmatched: u64,
}

#[derive(Debug, Clone)]
struct PendingPublish {
    topic: String,
    payload: Bytes,
    retain: bool,
}

#[derive(Clone)]
struct ActiveSession {
    generation: u64,
    session: Arc<dyn Session>,
}

struct Inner {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    state: RwLock<LinkState>,
    connect_gate: tokio::sync::Mutex<()>,
    session: RwLock<Option<ActiveSession>>,
    generation: AtomicU64,
    pending: Mutex<VecDeque<PendingPublish>>,
    flush_gate: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    scheduler: Scheduler,
    shutdown_tx: watch::Sender<bool>,
    disposed: AtomicBool,
    reconnect_loop: AtomicBool,
    stats: RwLock<LinkStats>,
}

/// Resilient connection to one MQTT broker
pub struct LinkManager {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, TransportEvent)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkManager {
    /// Create a disconnected manager
    pub fn new(config: LinkConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                handlers: RwLock::new(HashMap::new()),
                state: RwLock::new(LinkState::Disconnected),
                connect_gate: tokio::sync::Mutex::new(()),
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
                pending: Mutex::new(VecDeque::new()),
                flush_gate: tokio::sync::Mutex::new(()),
                events_tx,
                scheduler: Scheduler::new(),
                shutdown_tx,
                disposed: AtomicBool::new(false),
                reconnect_loop: AtomicBool::new(false),
                stats: RwLock::new(LinkStats::default()),
            }),
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Route messages on `topic` to `handler`
    ///
    /// Topics are subscribed on every connect, so handlers should be
    /// registered before the first [`LinkManager::ensure_connected`].
    pub fn register_handler(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let topic = topic.into();
        debug!(topic = %topic, "Handler registered");
        self.inner.handlers.write().insert(topic, handler);
    }

    /// Stop routing `topic`; returns `false` if no handler was registered
    pub fn remove_handler(&self, topic: &str) -> bool {
        self.inner.handlers.write().remove(topic).is_some()
    }

    /// Start the inbound event loop
    pub fn start(&self) -> Result<()> {
        let rx = self
            .events_rx
            .lock()
            .take()
            .ok_or(LinkError::AlreadyRunning("link manager"))?;
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        self.tasks
            .lock()
            .push(tokio::spawn(event_loop(inner, rx, shutdown)));
        Ok(())
    }

    /// Retry the connection and flush the buffer in the background
    ///
    /// The sleep between iterations grows by the backoff step up to the cap
    /// while disconnected and resets to the floor once connected.
    pub fn spawn_reconnect_loop(&self) {
        if self.inner.reconnect_loop.swap(true, Ordering::AcqRel) {
            debug!("Reconnect loop already running");
            return;
        }
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let reconnect = inner.config.reconnect.clone();
            let mut delay = reconnect.backoff_floor;
            loop {
                let connected = inner.ensure_connected().await;
                if connected && !inner.pending.lock().is_empty() {
                    inner.flush().await;
                }
                delay = reconnect.next_backoff(delay, inner.state() == LinkState::Connected);
                trace!(delay_ms = delay.as_millis() as u64, "Reconnect loop sleeping");
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Reconnect loop stopped");
        });
        self.tasks.lock().push(handle);
    }

    /// Connect on a scheduled task, retrying with backoff until it succeeds
    ///
    /// Does nothing when the background loop owns reconnection.
    pub fn connect_in_background(&self) {
        if self.inner.reconnect_loop.load(Ordering::Acquire) {
            return;
        }
        self.inner.schedule_reconnect(Duration::ZERO);
    }

    /// Make sure the link is connected, connecting if needed
    ///
    /// Concurrent callers collapse into one connect attempt. Failures are
    /// logged; the return value says whether the link is connected now.
    pub async fn ensure_connected(&self) -> bool {
        self.inner.ensure_connected().await
    }

    /// Publish at QoS 1 without retain
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<PublishOutcome> {
        self.inner.publish(topic, payload.into(), false).await
    }

    /// Publish a retained message
    pub async fn publish_retained(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishOutcome> {
        self.inner.publish(topic, payload.into(), true).await
    }

    /// Publish buffered messages in order, returning how many were sent
    pub async fn flush(&self) -> usize {
        self.inner.flush().await
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// Check if the link is connected
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Number of buffered publishes
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Generation of the most recent connect attempt
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> LinkStats {
        self.inner.stats.read().clone()
    }

    /// Topics with a registered handler
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics()
    }

    /// Stop background work and close the connection
    ///
    /// Buffered messages are kept but no longer flushed. Calling this twice
    /// is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.scheduler.dispose_all().await;

        let _gate = self.inner.connect_gate.lock().await;
        let was_connected = self.inner.state() == LinkState::Connected;
        let active = self.inner.session.write().take();
        self.inner.set_state(LinkState::Disconnected);
        if let Some(active) = active {
            if was_connected {
                if let Err(e) = active.session.disconnect().await {
                    debug!("Disconnect on shutdown failed: {}", e);
                }
            }
        }
        info!(pending = self.pending_len(), "Link manager shut down");
    }
}

#[async_trait]
impl MessageSink for LinkManager {
    async fn send(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        self.publish(&message.topic, message.payload.clone()).await?;
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    fn active_session(&self) -> Option<ActiveSession> {
        self.session.read().clone()
    }

    fn buffer(&self, item: PendingPublish) {
        trace!(topic = %item.topic, "Publish buffered");
        self.pending.lock().push_back(item);
        self.stats.write().buffered += 1;
    }

    async fn ensure_connected(self: &Arc<Self>) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.state() == LinkState::Connected {
            return true;
        }

        let _gate = self.connect_gate.lock().await;
        if self.state() == LinkState::Connected {
            return true;
        }
        if self.is_disposed() {
            return false;
        }
        self.set_state(LinkState::Connecting);

        let stale = self.session.write().take();
        if let Some(stale) = stale {
            debug!(generation = stale.generation, "Tearing down stale session");
            if let Err(e) = stale.session.disconnect().await {
                trace!("Stale session disconnect failed: {}", e);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let events = EventSink {
            generation,
            tx: self.events_tx.clone(),
        };
        self.stats.write().connect_attempts += 1;
        debug!(
            host = %self.config.host,
            port = self.config.port,
            generation,
            "Connecting to broker"
        );

        let topics = self.topics();
        let attempt = async {
            let session = self.connector.connect(&self.config, events).await?;
            for topic in &topics {
                if let Err(e) = session.subscribe(topic).await {
                    let _ = session.disconnect().await;
                    return Err(LinkError::SubscribeFailed {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            Ok(session)
        };

        let timeout = self.config.connect_timeout;
        let mut shutdown = self.shutdown_tx.subscribe();
        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Err(LinkError::ShutDown("link manager")),
            attempt = tokio::time::timeout(timeout, attempt) => match attempt {
                Ok(result) => result,
                Err(_) => Err(LinkError::ConnectionTimeout {
                    duration_ms: timeout.as_millis() as u64,
                }),
            },
        };

        match result {
            Ok(session) => {
                *self.session.write() = Some(ActiveSession {
                    generation,
                    session,
                });
                self.set_state(LinkState::Connected);
                info!(generation, topics = topics.len(), "Connected to broker");
                true
            }
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                self.stats.write().connect_failures += 1;
                warn!(code = e.error_code(), "Broker connect failed: {}", e);
                false
            }
        }
    }

    async fn publish(
        self: &Arc<Self>,
        topic: &str,
        payload: Bytes,
        retain: bool,
    ) -> Result<PublishOutcome> {
        if self.is_disposed() {
            return Err(LinkError::ShutDown("link manager"));
        }
        let item = PendingPublish {
            topic: topic.to_string(),
            payload,
            retain,
        };

        if !self.ensure_connected().await {
            self.buffer(item);
            return Ok(PublishOutcome::Buffered);
        }

        let _flush = self.flush_gate.lock().await;
        if !self.pending.lock().is_empty() {
            // Older messages go first
            self.buffer(item);
            self.drain_pending().await;
            return Ok(if self.pending.lock().is_empty() {
                PublishOutcome::Sent
            } else {
                PublishOutcome::Buffered
            });
        }

        let Some(active) = self.active_session() else {
            self.buffer(item);
            return Ok(PublishOutcome::Buffered);
        };
        match active
            .session
            .publish(&item.topic, item.payload.clone(), item.retain)
            .await
        {
            Ok(()) => {
                self.stats.write().sent += 1;
                trace!(topic = %item.topic, bytes = item.payload.len(), "Published");
                Ok(PublishOutcome::Sent)
            }
            Err(e) => {
                warn!(topic = %item.topic, code = e.error_code(), "Publish failed, buffering: {}", e);
                self.buffer(item);
                self.mark_disconnected(active.generation).await;
                Ok(PublishOutcome::Buffered)
            }
        }
    }

    async fn flush(self: &Arc<Self>) -> usize {
        let _flush = self.flush_gate.lock().await;
        self.drain_pending().await
    }

    // Caller holds the flush gate
    async fn drain_pending(&self) -> usize {
        let mut flushed = 0;
        loop {
            if self.state() != LinkState::Connected {
                break;
            }
            let Some(active) = self.active_session() else {
                break;
            };
            let Some(item) = self.pending.lock().pop_front() else {
                break;
            };
            match active
                .session
                .publish(&item.topic, item.payload.clone(), item.retain)
                .await
            {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!(
                        topic = %item.topic,
                        code = e.error_code(),
                        remaining = self.pending.lock().len() + 1,
                        "Flush halted: {}",
                        e
                    );
                    self.pending.lock().push_front(item);
                    self.mark_disconnected(active.generation).await;
                    break;
                }
            }
        }
        if flushed > 0 {
            self.stats.write().flushed += flushed as u64;
            debug!(flushed, "Pending publishes flushed");
        }
        flushed
    }

    async fn mark_disconnected(&self, generation: u64) -> bool {
        let _gate = self.connect_gate.lock().await;
        if generation != self.generation.load(Ordering::Acquire) {
            return false;
        }
        self.set_state(LinkState::Disconnected);
        true
    }

    async fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: String) {
        if !self.mark_disconnected(generation).await {
            debug!(generation, "Ignoring disconnect from stale connection");
            return;
        }
        self.stats.write().disconnects += 1;
        warn!(generation, reason = %reason, "Broker connection lost");

        if self.reconnect_loop.load(Ordering::Acquire) {
            trace!(generation, "Reconnect loop will pick this up");
        } else if self.config.reconnect.reconnect_on_disconnect && !self.is_disposed() {
            self.schedule_reconnect(self.config.reconnect.disconnect_delay);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.scheduler.schedule("reconnect", delay, move || async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if inner.ensure_connected().await {
                inner.flush().await;
            } else if !inner.is_disposed() {
                let next = inner.config.reconnect.next_backoff(delay, false);
                inner.schedule_reconnect(next);
            }
            Ok(())
        });
    }

    async fn dispatch(&self, topic: &str, payload: Bytes) {
        let handler = self.handlers.read().get(topic).cloned();
        let Some(handler) = handler else {
            self.stats.write().messages_unmatched += 1;
            trace!(topic = %topic, "No handler for topic");
            return;
        };
        self.stats.write().messages_routed += 1;

        match AssertUnwindSafe(handler.handle(topic, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(topic = %topic, "Message handler failed: {:#}", e),
            Err(_) => error!(topic = %topic, "Message handler panicked"),
        }
    }
}

async fn event_loop(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (generation, event) = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::Message { topic, payload } => {
                inner.dispatch(&topic, payload).await;
            }
            TransportEvent::Disconnected { reason } => {
                inner.handle_disconnect(generation, reason).await;
            }
        }
    }
    debug!("Link event loop stopped");
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBroker, RecordingHandler};

    fn config() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.reconnect.disconnect_delay = Duration::from_secs(5);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_connected_collapses() {
        let broker = MockBroker::new();
        broker.set_connect_delay(Duration::from_millis(200));
        let link = Arc::new(LinkManager::new(config(), broker.connector()));

        let attempts = (0..8).map(|_| {
            let link = link.clone();
            async move { link.ensure_connected().await }
        });
        let results = futures::future::join_all(attempts).await;

        assert!(results.into_iter().all(|connected| connected));
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(link.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_not_an_error() {
        let broker = MockBroker::new();
        broker.set_online(false);
        let link = LinkManager::new(config(), broker.connector());

        assert!(!link.ensure_connected().await);
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.stats().connect_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let broker = MockBroker::new();
        broker.set_connect_delay(Duration::from_secs(60));
        let mut config = config();
        config.connect_timeout = Duration::from_secs(2);
        let link = LinkManager::new(config, broker.connector());

        assert!(!link.ensure_connected().await);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_registered_topics() {
        let broker = MockBroker::new();
        let link = LinkManager::new(config(), broker.connector());
        link.register_handler("b/topic", Arc::new(RecordingHandler::default()));
        link.register_handler("a/topic", Arc::new(RecordingHandler::default()));

        assert!(link.ensure_connected().await);
        assert_eq!(broker.subscriptions(), vec!["a/topic", "b/topic"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_exact_topic_match() {
        let broker = MockBroker::new();
        let link = LinkManager::new(config(), broker.connector());
        let handler = Arc::new(RecordingHandler::default());
        link.register_handler("mesh/in", handler.clone());
        link.start().unwrap();
        assert!(link.ensure_connected().await);

        broker.inject("mesh/in", Bytes::from_static(b"one"));
        broker.inject("MESH/IN", Bytes::from_static(b"two"));
        broker.inject("mesh/in/extra", Bytes::from_static(b"three"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(handler.payloads(), vec![Bytes::from_static(b"one")]);
        let stats = link.stats();
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.messages_unmatched, 2);
        link.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_after_shutdown_fails() {
        let broker = MockBroker::new();
        let link = LinkManager::new(config(), broker.connector());
        assert!(link.ensure_connected().await);

        link.shutdown().await;
        link.shutdown().await;
        assert_eq!(broker.disconnect_count(), 1);
        assert!(matches!(
            link.publish("t", Bytes::from_static(b"x")).await,
            Err(LinkError::ShutDown(_))
        ));
        assert!(!link.ensure_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let broker = MockBroker::new();
        let link = LinkManager::new(config(), broker.connector());
        link.start().unwrap();
        let err = link.start().unwrap_err();
        assert!(matches!(err, LinkError::AlreadyRunning("link manager")));
        assert_eq!(err.to_string(), "link manager is already running");
        link.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_loop_owns_reconnection() {
        let broker = MockBroker::new();
        let link = LinkManager::new(config(), broker.connector());
        link.start().unwrap();
        link.spawn_reconnect_loop();
        link.spawn_reconnect_loop();
        link.connect_in_background();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(link.is_connected());
        assert_eq!(link.inner.scheduler.pending(), 0);

        broker.drop_connection("network down");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.inner.scheduler.pending(), 0);

        // The loop wakes at its floor interval, well before the disconnect delay
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(link.is_connected());
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(link.stats().connect_attempts, 2);

        link.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_in_background_retries() {
        let broker = MockBroker::new();
        broker.fail_connects(2);
        let link = LinkManager::new(config(), broker.connector());
        link.start().unwrap();

        // attempts at t = 0s, 2s and 6s
        link.connect_in_background();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!link.is_connected());
        assert_eq!(link.stats().connect_attempts, 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(link.is_connected());
        assert_eq!(link.stats().connect_attempts, 3);

        link.shutdown().await;
    }
}
