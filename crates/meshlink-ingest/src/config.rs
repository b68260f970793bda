//! Ingest process configuration

use meshlink_core::config::humantime_serde;
use meshlink_core::{LinkConfig, TopicConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default HTTP listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// How per-gateway liveness folds into one health answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HealthMode {
    /// Unhealthy only when every monitored gateway is offline
    #[default]
    All,
    /// Unhealthy as soon as one monitored gateway is offline
    Any,
}

/// Thresholds for the status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Window after startup in which a missing status payload is expected
    #[serde(with = "humantime_serde", default = "default_grace")]
    pub grace: Duration,

    /// A status payload older than this is reported stale
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,

    /// A gateway not heard from for this long is offline
    #[serde(with = "humantime_serde", default = "default_offline_after")]
    pub offline_after: Duration,

    /// Aggregation mode
    #[serde(default)]
    pub mode: HealthMode,
}

fn default_grace() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_offline_after() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            grace: default_grace(),
            stale_after: default_stale_after(),
            offline_after: default_offline_after(),
            mode: HealthMode::All,
        }
    }
}

/// Complete ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// HTTP listen address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Expected value of the webhook secret header; `None` disables the check
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Broker link settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Topic names shared with the gateway
    #[serde(default)]
    pub topics: TopicConfig,

    /// Status endpoint thresholds
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_secret: None,
            link: LinkConfig::default(),
            topics: TopicConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}
