//! Meshlink ingest - webhook to MQTT
//!
//! Receives chat platform updates over HTTP and republishes them onto the
//! chat topic, so the gateway never needs an inbound port. The same process
//! answers `/health` and `/status` from the gateway's retained status
//! payload.
//!
//! ```ignore
//! let state = AppState::new(&config, Arc::new(MqttConnector::new()));
//! state.start()?;
//! axum::serve(listener, create_router(state.clone())).await?;
//! ```

pub mod config;
pub mod server;

use meshlink_core::{Connector, LinkManager};
use std::sync::Arc;

pub use config::{HealthConfig, HealthMode, IngestConfig};
pub use server::create_router;
pub use server::status::{HealthReport, HealthState, StatusTracker};

/// Ingest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state behind the HTTP handlers
pub struct AppState {
    /// Broker link used for republishing
    pub link: Arc<LinkManager>,
    /// Topic updates are republished on
    pub chat_topic: String,
    /// Expected webhook secret, if validation is enabled
    pub webhook_secret: Option<String>,
    /// Latest gateway status
    pub status: Arc<StatusTracker>,
    /// Status endpoint thresholds
    pub health: HealthConfig,
}

impl AppState {
    /// Build the link and subscribe the status tracker to the status topic
    pub fn new(config: &IngestConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let link = Arc::new(LinkManager::new(config.link.clone(), connector));
        let status = Arc::new(StatusTracker::new());
        link.register_handler(config.topics.status.clone(), status.clone());
        Arc::new(Self {
            link,
            chat_topic: config.topics.chat_updates.clone(),
            webhook_secret: config.webhook_secret.clone().filter(|s| !s.is_empty()),
            status,
            health: config.health.clone(),
        })
    }

    /// Start the inbound loop and the background reconnect loop
    pub fn start(&self) -> meshlink_core::Result<()> {
        self.link.start()?;
        self.link.spawn_reconnect_loop();
        Ok(())
    }
}
