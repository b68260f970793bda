//! Gateway liveness tracking and the retained status announcement

use chrono::{DateTime, Utc};
use meshlink_core::{
    Dispatcher, GatewaySeen, GatewayStatus, LinkManager, QueueDepths, RegistrationStorage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Last time each forwarding gateway was heard on the mesh topic
#[derive(Default)]
pub struct GatewayTracker {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl GatewayTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic forwarded by `gateway_id`
    pub fn touch(&self, gateway_id: &str) {
        self.seen.lock().insert(gateway_id.to_string(), Utc::now());
    }

    /// When traffic from `gateway_id` was last seen by this process
    pub fn last_seen(&self, gateway_id: &str) -> Option<DateTime<Utc>> {
        self.seen.lock().get(gateway_id).copied()
    }

    /// Number of gateways seen
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether no other gateway has been seen yet
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

/// Publishes the retained status payload
pub struct StatusAnnouncer {
    gateway_id: String,
    topic: String,
    link: Arc<LinkManager>,
    dispatcher: Arc<Dispatcher>,
    storage: Arc<dyn RegistrationStorage>,
    tracker: Arc<GatewayTracker>,
}

impl StatusAnnouncer {
    /// Create an announcer publishing on `topic` through `link`
    pub fn new(
        gateway_id: impl Into<String>,
        topic: impl Into<String>,
        link: Arc<LinkManager>,
        dispatcher: Arc<Dispatcher>,
        storage: Arc<dyn RegistrationStorage>,
        tracker: Arc<GatewayTracker>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            topic: topic.into(),
            link,
            dispatcher,
            storage,
            tracker,
        }
    }

    /// Build the current status, persisting newer last-seen times
    pub async fn snapshot(&self) -> meshlink_core::Result<GatewayStatus> {
        let mut gateways = Vec::new();
        for mut record in self.storage.list_gateways().await? {
            if let Some(seen) = self.tracker.last_seen(&record.gateway_id) {
                if seen > record.last_seen {
                    record.last_seen = seen;
                    self.storage.upsert_gateway(&record).await?;
                }
            }
            gateways.push(GatewaySeen {
                gateway_id: record.gateway_id,
                last_seen: record.last_seen,
            });
        }

        Ok(GatewayStatus {
            gateway_id: self.gateway_id.clone(),
            last_seen: Utc::now(),
            version: crate::VERSION.to_string(),
            queues: QueueDepths::new(self.dispatcher.queue_lens(), self.link.pending_len()),
            gateways,
        })
    }

    /// Publish one retained status message
    pub async fn announce(&self) -> anyhow::Result<()> {
        let status = self.snapshot().await?;
        let outcome = self
            .link
            .publish_retained(&self.topic, status.to_json()?)
            .await?;
        debug!(
            topic = %self.topic,
            gateways = status.gateways.len(),
            outcome = ?outcome,
            "Status announced"
        );
        if status.queues.pending_publishes > 0 {
            warn!(
                pending = status.queues.pending_publishes,
                "Broker link has buffered publishes"
            );
        }
        Ok(())
    }
}
