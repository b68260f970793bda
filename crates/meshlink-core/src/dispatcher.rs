//! Priority-based, rate-limited outgoing dispatcher
//!
//! The mesh is the scarce resource: every send consumes airtime shared by
//! all nodes. Messages wait in three strict-priority FIFO queues and a single
//! consumer hands them to a [`MessageSink`] no faster than the configured
//! rate. The "last sent" clock is global, not per priority.
//!
//! ```text
//!   enqueue(High)   ─┐
//!   enqueue(Normal) ─┼─► queues ─► signal ─► consumer ─► gap wait ─► sink
//!   enqueue(Low)    ─┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{LinkError, Result};

/// Message priority, `High > Normal > Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Periodic announcements and other background traffic
    Low,
    /// Relayed chat messages
    Normal,
    /// Codes and replies a user is waiting for
    High,
}

impl Priority {
    /// All priorities in drain order
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// A message waiting for the mesh
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// MQTT topic the envelope is published on
    pub topic: String,
    /// Destination node, for logging
    pub recipient: u32,
    /// Encoded envelope
    pub payload: Bytes,
    /// When the message was queued
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    /// Create a message stamped with the current time
    pub fn new(topic: impl Into<String>, recipient: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            recipient,
            payload: payload.into(),
            enqueued_at: Instant::now(),
        }
    }
}

/// Send callback invoked by the consumer loop
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hand one message to the transport
    async fn send(&self, message: &QueuedMessage) -> anyhow::Result<()>;
}

/// Queue lengths snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLens {
    /// High-priority backlog
    pub high: usize,
    /// Normal-priority backlog
    pub normal: usize,
    /// Low-priority backlog
    pub low: usize,
}

impl QueueLens {
    /// Total backlog
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// Messages accepted by `enqueue`
    pub enqueued: u64,
    /// Messages the sink accepted
    pub sent: u64,
    /// Messages the sink rejected
    pub failed: u64,
    /// Messages put back at stop
    pub requeued: u64,
}

struct Shared {
    queues: [Mutex<VecDeque<QueuedMessage>>; 3],
    signal: Semaphore,
    last_sent: Mutex<Option<Instant>>,
    interval: Duration,
    sink: Arc<dyn MessageSink>,
    stats: RwLock<DispatcherStats>,
}

impl Shared {
    fn dequeue(&self) -> Option<(Priority, QueuedMessage)> {
        Priority::DRAIN_ORDER.iter().find_map(|&priority| {
            self.queues[priority.index()]
                .lock()
                .pop_front()
                .map(|message| (priority, message))
        })
    }

    fn requeue_front(&self, priority: Priority, message: QueuedMessage) {
        self.queues[priority.index()].lock().push_front(message);
        self.signal.add_permits(1);
        self.stats.write().requeued += 1;
    }

    fn remaining_gap(&self, now: Instant) -> Duration {
        match *self.last_sent.lock() {
            Some(last) => (last + self.interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    async fn send(&self, priority: Priority, message: QueuedMessage) {
        let result = self.sink.send(&message).await;
        *self.last_sent.lock() = Some(Instant::now());

        let mut stats = self.stats.write();
        match result {
            Ok(()) => {
                stats.sent += 1;
                trace!(
                    topic = %message.topic,
                    recipient = message.recipient,
                    priority = ?priority,
                    queued_ms = message.enqueued_at.elapsed().as_millis() as u64,
                    "Message dispatched"
                );
            }
            Err(e) => {
                stats.failed += 1;
                warn!(
                    topic = %message.topic,
                    recipient = message.recipient,
                    "Send callback failed: {:#}",
                    e
                );
            }
        }
    }
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Rate-limited priority dispatcher
pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Dispatcher {
    /// Create a stopped dispatcher feeding `sink`
    pub fn new(config: &DispatcherConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: [
                    Mutex::new(VecDeque::new()),
                    Mutex::new(VecDeque::new()),
                    Mutex::new(VecDeque::new()),
                ],
                signal: Semaphore::new(0),
                last_sent: Mutex::new(None),
                interval: config.send_interval(),
                sink,
                stats: RwLock::new(DispatcherStats::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Minimum spacing between two sends
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Queue a message and return the estimated wait before it is sent
    ///
    /// The estimate counts every message ahead of this one (same or higher
    /// priority) plus what is left of the current send gap. It is advisory.
    pub fn enqueue(&self, message: QueuedMessage, priority: Priority) -> Duration {
        let lens = self.queue_lens();
        let ahead = match priority {
            Priority::High => lens.high,
            Priority::Normal => lens.high + lens.normal,
            Priority::Low => lens.total(),
        };
        let gap = self.shared.remaining_gap(Instant::now());

        debug!(
            topic = %message.topic,
            recipient = message.recipient,
            priority = ?priority,
            ahead,
            "Message queued"
        );
        self.shared.queues[priority.index()].lock().push_back(message);
        self.shared.stats.write().enqueued += 1;
        self.shared.signal.add_permits(1);

        self.shared.interval * (ahead as u32) + gap
    }

    /// Current backlog per priority
    pub fn queue_lens(&self) -> QueueLens {
        QueueLens {
            high: self.shared.queues[Priority::High.index()].lock().len(),
            normal: self.shared.queues[Priority::Normal.index()].lock().len(),
            low: self.shared.queues[Priority::Low.index()].lock().len(),
        }
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats.read().clone()
    }

    /// Check if the consumer loop is running
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Spawn the consumer loop
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(LinkError::AlreadyRunning("dispatcher"));
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(self.shared.clone(), stop_rx));
        *worker = Some(Worker { stop_tx, handle });
        info!(interval_ms = self.shared.interval.as_millis() as u64, "Dispatcher started");
        Ok(())
    }

    /// Stop the consumer loop and wait for it to exit
    ///
    /// A message caught in the rate-limit wait goes back to the front of its
    /// queue. Stopping a stopped dispatcher is a no-op.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop_tx.send(true);
        if let Err(e) = worker.handle.await {
            if e.is_panic() {
                warn!("Dispatcher loop panicked");
            }
        }
        info!(backlog = self.queue_lens().total(), "Dispatcher stopped");
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        tokio::select! {
            biased;
            _ = stop.changed() => return,
            permit = shared.signal.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return,
            },
        }

        // More permits than messages is normal: the loop drains everything
        // it finds, later permits then see empty queues.
        while let Some((priority, message)) = shared.dequeue() {
            let wait = shared.remaining_gap(Instant::now());
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = stop.changed() => {
                        debug!(topic = %message.topic, "Stopped during send gap, message requeued");
                        shared.requeue_front(priority, message);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            shared.send(priority, message).await;
        }
    }
}
