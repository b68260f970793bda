//! Gateway health from the retained status payload
//!
//! The gateway publishes a retained [`GatewayStatus`] on the status topic;
//! the broker hands the latest copy to this process on subscribe and every
//! update after that. The endpoints answer from that copy only.

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, Json};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use meshlink_core::{GatewayStatus, MessageHandler};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{HealthConfig, HealthMode};
use crate::AppState;

/// Overall health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No status yet, still inside the startup grace window
    Starting,
    /// No status arrived during the grace window
    NoUpdates,
    /// Status payload is older than the staleness threshold
    Stale,
    /// Monitored gateways are offline per the aggregation mode
    Offline,
    /// Everything reporting in
    Ok,
}

impl HealthState {
    pub fn is_healthy(self) -> bool {
        matches!(self, HealthState::Starting | HealthState::Ok)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::NoUpdates => "no status received",
            HealthState::Stale => "no recent updates",
            HealthState::Offline => "offline",
            HealthState::Ok => "ok",
        }
    }
}

/// Liveness of one monitored gateway
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub gateway_id: String,
    pub last_seen: DateTime<Utc>,
    pub minutes_since_seen: i64,
    pub online: bool,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub mode: HealthMode,
    pub status_last_seen: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub gateways: Vec<GatewayHealth>,
}

impl HealthReport {
    pub fn status_code(&self) -> StatusCode {
        if self.state.is_healthy() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Keeps the latest status payload
pub struct StatusTracker {
    started: Instant,
    latest: RwLock<Option<GatewayStatus>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            latest: RwLock::new(None),
        }
    }

    pub fn record(&self, status: GatewayStatus) {
        *self.latest.write() = Some(status);
    }

    pub fn latest(&self) -> Option<GatewayStatus> {
        self.latest.read().clone()
    }

    /// Evaluate health at `now`
    pub fn evaluate(&self, config: &HealthConfig, now: DateTime<Utc>) -> HealthReport {
        let Some(status) = self.latest() else {
            let state = if self.started.elapsed() < config.grace {
                HealthState::Starting
            } else {
                HealthState::NoUpdates
            };
            return HealthReport {
                state,
                mode: config.mode,
                status_last_seen: None,
                version: None,
                gateways: Vec::new(),
            };
        };

        let offline_after = chrono::Duration::from_std(config.offline_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let gateways: Vec<GatewayHealth> = status
            .monitored()
            .into_iter()
            .map(|seen| {
                let since = now - seen.last_seen;
                GatewayHealth {
                    gateway_id: seen.gateway_id,
                    last_seen: seen.last_seen,
                    minutes_since_seen: since.num_minutes(),
                    online: since <= offline_after,
                }
            })
            .collect();

        let stale_after = chrono::Duration::from_std(config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let offline = match config.mode {
            HealthMode::All => gateways.iter().all(|g| !g.online),
            HealthMode::Any => gateways.iter().any(|g| !g.online),
        };
        let state = if now - status.last_seen > stale_after {
            HealthState::Stale
        } else if offline {
            HealthState::Offline
        } else {
            HealthState::Ok
        };

        HealthReport {
            state,
            mode: config.mode,
            status_last_seen: Some(status.last_seen),
            version: Some(status.version),
            gateways,
        }
    }
}

#[async_trait]
impl MessageHandler for StatusTracker {
    async fn handle(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        let status = GatewayStatus::from_json(&payload)?;
        debug!(
            topic = %topic,
            gateway = %status.gateway_id,
            gateways = status.gateways.len(),
            "Gateway status received"
        );
        self.record(status);
        Ok(())
    }
}

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    let report = state.status.evaluate(&state.health, Utc::now());
    (report.status_code(), report.state.as_str())
}

/// Detailed status endpoint
pub async fn status(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.status.evaluate(&state.health, Utc::now());
    (report.status_code(), Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::GatewaySeen;
    use std::time::Duration;

    fn status_at(last_seen: DateTime<Utc>, gateways: Vec<GatewaySeen>) -> GatewayStatus {
        GatewayStatus {
            gateway_id: "!00000001".to_string(),
            last_seen,
            version: "0.1.0".to_string(),
            queues: Default::default(),
            gateways,
        }
    }

    fn seen(id: &str, minutes_ago: i64, now: DateTime<Utc>) -> GatewaySeen {
        GatewaySeen {
            gateway_id: id.to_string(),
            last_seen: now - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_then_no_updates() {
        let tracker = StatusTracker::new();
        let config = HealthConfig::default();

        let report = tracker.evaluate(&config, Utc::now());
        assert_eq!(report.state, HealthState::Starting);
        assert_eq!(report.status_code(), StatusCode::OK);

        tokio::time::advance(config.grace + Duration::from_secs(1)).await;
        let report = tracker.evaluate(&config, Utc::now());
        assert_eq!(report.state, HealthState::NoUpdates);
        assert_eq!(report.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_stale_payload() {
        let tracker = StatusTracker::new();
        let now = Utc::now();
        tracker.record(status_at(now - chrono::Duration::minutes(20), Vec::new()));

        let report = tracker.evaluate(&HealthConfig::default(), now);
        assert_eq!(report.state, HealthState::Stale);
    }

    #[test]
    fn test_aggregation_modes() {
        let tracker = StatusTracker::new();
        let now = Utc::now();
        tracker.record(status_at(
            now,
            vec![seen("!00000002", 5, now), seen("!00000003", 90, now)],
        ));

        let mut config = HealthConfig::default();
        let report = tracker.evaluate(&config, now);
        assert_eq!(report.state, HealthState::Ok);
        assert!(report.gateways[0].online);
        assert!(!report.gateways[1].online);
        assert_eq!(report.gateways[1].minutes_since_seen, 90);

        config.mode = HealthMode::Any;
        let report = tracker.evaluate(&config, now);
        assert_eq!(report.state, HealthState::Offline);
    }

    #[test]
    fn test_announcer_monitored_when_list_empty() {
        let tracker = StatusTracker::new();
        let now = Utc::now();
        tracker.record(status_at(now - chrono::Duration::minutes(2), Vec::new()));

        let report = tracker.evaluate(&HealthConfig::default(), now);
        assert_eq!(report.state, HealthState::Ok);
        assert_eq!(report.gateways.len(), 1);
        assert_eq!(report.gateways[0].gateway_id, "!00000001");
    }
}
