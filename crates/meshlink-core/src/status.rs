//! Gateway status payload
//!
//! The gateway publishes a [`GatewayStatus`] as a retained JSON message on
//! the status topic; the ingest process evaluates the last one it received.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatcher::QueueLens;
use crate::error::{LinkError, Result};

/// Last-seen entry for one mesh gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySeen {
    /// Node id string (`!1234abcd`)
    pub gateway_id: String,
    /// Last time traffic or a heartbeat was seen from it
    pub last_seen: DateTime<Utc>,
}

/// Outgoing queue depths at announcement time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    /// High-priority queue
    pub high: usize,
    /// Normal-priority queue
    pub normal: usize,
    /// Low-priority queue
    pub low: usize,
    /// Publishes buffered while the broker link is down
    pub pending_publishes: usize,
}

impl QueueDepths {
    /// Combine dispatcher queue lengths with the link's pending buffer
    pub fn new(queues: QueueLens, pending_publishes: usize) -> Self {
        Self {
            high: queues.high,
            normal: queues.normal,
            low: queues.low,
            pending_publishes,
        }
    }
}

/// Retained status announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Announcing gateway
    pub gateway_id: String,
    /// Announcement time
    pub last_seen: DateTime<Utc>,
    /// Gateway software version
    pub version: String,
    /// Queue depths
    #[serde(default)]
    pub queues: QueueDepths,
    /// Registered mesh gateways and when they were last heard
    #[serde(default)]
    pub gateways: Vec<GatewaySeen>,
}

impl GatewayStatus {
    /// Gateways whose liveness should be judged
    ///
    /// Falls back to the announcing gateway when none are registered.
    pub fn monitored(&self) -> Vec<GatewaySeen> {
        if self.gateways.is_empty() {
            vec![GatewaySeen {
                gateway_id: self.gateway_id.clone(),
                last_seen: self.last_seen,
            }]
        } else {
            self.gateways.clone()
        }
    }

    /// Serialize for publishing
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LinkError::Internal(e.to_string()))
    }

    /// Parse a received payload
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| LinkError::InvalidEnvelope(e.to_string()))
    }
}
