//! Configuration types for the gateway core
//!
//! This module provides configuration structures for the MQTT link, the
//! outgoing mesh dispatcher, inbound admission and the registration state.
//! Every window and attempt limit is a field with the observed default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LinkError, Result};

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default maximum mesh sends per minute
pub const DEFAULT_MAX_MESSAGES_PER_MINUTE: u32 = 20;

/// Default duplicate-detection window
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3 * 60);

/// Default inactivity window for conversation state
pub const DEFAULT_CHAT_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Default lifetime of a one-time code
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(10 * 60);

/// Default verification attempts before a code is discarded
pub const DEFAULT_MAX_CODE_ATTEMPTS: u32 = 5;

/// Default lifetime of a cached device record
pub const DEFAULT_DEVICE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Length of a device public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// Default hop limit for packets the gateway originates
pub const DEFAULT_HOP_LIMIT: u32 = 3;

/// Aggregate configuration for a gateway deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// MQTT link settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Topic names
    #[serde(default)]
    pub topics: TopicConfig,

    /// Outgoing mesh pacing
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Inbound duplicate filtering
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Conversation and registration state
    #[serde(default)]
    pub session: SessionConfig,

    /// Gateway identity on the mesh and periodic work
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl GatewayConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|e| LinkError::InvalidConfig(e.to_string()))
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Broker host name
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Broker user name
    #[serde(default)]
    pub username: Option<String>,

    /// Broker password
    #[serde(default)]
    pub password: Option<String>,

    /// Connect over TLS
    #[serde(default)]
    pub use_tls: bool,

    /// Accept a broker certificate the system trust store does not vouch for
    ///
    /// The certificate (or the CA that signed it) is taken from `ca_file`
    /// and trusted on its own; the flag without a file is rejected.
    #[serde(default)]
    pub accept_untrusted_certs: bool,

    /// PEM certificate to trust for the broker connection
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Start a clean session on every connect
    ///
    /// The ingest process uses a clean session, the gateway keeps a
    /// persistent one so QoS 1 traffic survives short outages.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    /// MQTT keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Upper bound for a single connect + subscribe attempt
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// How long a publish waits for the broker's acknowledgement
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,

    /// Reconnection behavior
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_client_id() -> String {
    format!("meshlink-{}", uuid::Uuid::new_v4().simple())
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_MQTT_PORT,
            client_id: default_client_id(),
            username: None,
            password: None,
            use_tls: false,
            accept_untrusted_certs: false,
            ca_file: None,
            clean_session: true,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Schedule a reconnect after a disconnect notification
    #[serde(default = "default_reconnect_on_disconnect")]
    pub reconnect_on_disconnect: bool,

    /// Delay before reconnecting after a disconnect notification
    #[serde(with = "humantime_serde", default = "default_disconnect_delay")]
    pub disconnect_delay: Duration,

    /// Background loop interval while connected
    #[serde(with = "humantime_serde", default = "default_backoff_floor")]
    pub backoff_floor: Duration,

    /// Amount the loop interval grows per failed iteration
    #[serde(with = "humantime_serde", default = "default_backoff_step")]
    pub backoff_step: Duration,

    /// Maximum loop interval while disconnected
    #[serde(with = "humantime_serde", default = "default_backoff_cap")]
    pub backoff_cap: Duration,
}

fn default_reconnect_on_disconnect() -> bool {
    true
}

fn default_disconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_floor() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_step() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_on_disconnect: true,
            disconnect_delay: default_disconnect_delay(),
            backoff_floor: default_backoff_floor(),
            backoff_step: default_backoff_step(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

impl ReconnectConfig {
    /// Next background loop interval given the current one and link health
    pub fn next_backoff(&self, current: Duration, connected: bool) -> Duration {
        if connected {
            self.backoff_floor
        } else {
            (current + self.backoff_step).min(self.backoff_cap)
        }
    }
}

/// MQTT topic names shared by both processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Chat platform updates (JSON)
    #[serde(default = "default_chat_topic")]
    pub chat_updates: String,

    /// Mesh traffic (binary service envelopes)
    #[serde(default = "default_mesh_topic")]
    pub mesh: String,

    /// Gateway status (JSON, retained)
    #[serde(default = "default_status_topic")]
    pub status: String,
}

fn default_chat_topic() -> String {
    "meshlink/chat/updates".to_string()
}

fn default_mesh_topic() -> String {
    "msh/meshlink/2/e/gateway".to_string()
}

fn default_status_topic() -> String {
    "meshlink/status".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            chat_updates: default_chat_topic(),
            mesh: default_mesh_topic(),
            status: default_status_topic(),
        }
    }
}

/// Outgoing mesh pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum messages handed to the mesh per minute
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: u32,
}

fn default_max_messages_per_minute() -> u32 {
    DEFAULT_MAX_MESSAGES_PER_MINUTE
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_messages_per_minute: DEFAULT_MAX_MESSAGES_PER_MINUTE,
        }
    }
}

impl DispatcherConfig {
    /// Minimum spacing between two consecutive sends
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.max_messages_per_minute.max(1)))
    }
}

/// Inbound duplicate filtering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// How long a packet id is remembered
    #[serde(with = "humantime_serde", default = "default_dedup_ttl")]
    pub dedup_ttl: Duration,

    /// Memory guard on remembered packet ids
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

fn default_dedup_ttl() -> Duration {
    DEFAULT_DEDUP_TTL
}

fn default_dedup_capacity() -> usize {
    10_000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// Conversation and registration state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity window for non-default conversation states
    #[serde(with = "humantime_serde", default = "default_chat_state_ttl")]
    pub chat_state_ttl: Duration,

    /// Lifetime of a freshly issued one-time code
    #[serde(with = "humantime_serde", default = "default_code_ttl")]
    pub code_ttl: Duration,

    /// Verification attempts before a code is discarded
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,

    /// Lifetime of a cached device record
    #[serde(with = "humantime_serde", default = "default_device_cache_ttl")]
    pub device_cache_ttl: Duration,

    /// Memory guard on cached device records
    #[serde(default = "default_device_cache_capacity")]
    pub device_cache_capacity: usize,
}

fn default_chat_state_ttl() -> Duration {
    DEFAULT_CHAT_STATE_TTL
}

fn default_code_ttl() -> Duration {
    DEFAULT_CODE_TTL
}

fn default_max_code_attempts() -> u32 {
    DEFAULT_MAX_CODE_ATTEMPTS
}

fn default_device_cache_ttl() -> Duration {
    DEFAULT_DEVICE_CACHE_TTL
}

fn default_device_cache_capacity() -> usize {
    5_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chat_state_ttl: DEFAULT_CHAT_STATE_TTL,
            code_ttl: DEFAULT_CODE_TTL,
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
            device_cache_ttl: DEFAULT_DEVICE_CACHE_TTL,
            device_cache_capacity: default_device_cache_capacity(),
        }
    }
}

/// Gateway identity and periodic work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node id the gateway uses on the mesh (`!1234abcd`)
    #[serde(default = "default_gateway_id")]
    pub gateway_id: String,

    /// Hop limit for originated packets
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u32,

    /// Period of the retained status announcement
    #[serde(with = "humantime_serde", default = "default_status_interval")]
    pub status_interval: Duration,

    /// Period of the expired-entry sweep
    #[serde(with = "humantime_serde", default = "default_purge_interval")]
    pub purge_interval: Duration,
}

fn default_gateway_id() -> String {
    "!00000001".to_string()
}

fn default_hop_limit() -> u32 {
    DEFAULT_HOP_LIMIT
}

fn default_status_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            gateway_id: default_gateway_id(),
            hop_limit: DEFAULT_HOP_LIMIT,
            status_interval: default_status_interval(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl MeshConfig {
    /// Gateway node number parsed from `gateway_id`
    pub fn node_number(&self) -> Result<u32> {
        crate::envelope::parse_node_id(&self.gateway_id).ok_or_else(|| {
            LinkError::InvalidConfig(format!("invalid gateway id: {}", self.gateway_id))
        })
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set broker address
    pub fn broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.link.host = host.into();
        self.config.link.port = port;
        self
    }

    /// Set broker credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.link.username = Some(username.into());
        self.config.link.password = Some(password.into());
        self
    }

    /// Set MQTT client identifier
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.link.client_id = id.into();
        self
    }

    /// Enable TLS, optionally accepting untrusted certificates
    pub fn tls(mut self, accept_untrusted: bool) -> Self {
        self.config.link.use_tls = true;
        self.config.link.accept_untrusted_certs = accept_untrusted;
        self
    }

    /// Trust the PEM certificate at `path` for the broker connection
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.link.ca_file = Some(path.into());
        self
    }

    /// Keep a persistent broker session
    pub fn persistent_session(mut self) -> Self {
        self.config.link.clean_session = false;
        self
    }

    /// Set the mesh send rate
    pub fn max_messages_per_minute(mut self, rate: u32) -> Self {
        self.config.dispatcher.max_messages_per_minute = rate.max(1);
        self
    }

    /// Set the duplicate-detection window
    pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
        self.config.admission.dedup_ttl = ttl;
        self
    }

    /// Set the verification attempt limit
    pub fn max_code_attempts(mut self, attempts: u32) -> Self {
        self.config.session.max_code_attempts = attempts.max(1);
        self
    }

    /// Set the gateway node id
    pub fn gateway_id(mut self, id: impl Into<String>) -> Self {
        self.config.mesh.gateway_id = id.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

/// Serde adapter for durations written as humantime strings (`3m`, `1h 30s`)
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Write as a humantime string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    /// Parse a humantime string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.link.port, DEFAULT_MQTT_PORT);
        assert_eq!(config.admission.dedup_ttl, Duration::from_secs(180));
        assert_eq!(config.session.max_code_attempts, 5);
        assert!(config.link.client_id.starts_with("meshlink-"));
    }

    #[test]
    fn test_send_interval() {
        let config = DispatcherConfig {
            max_messages_per_minute: 20,
        };
        assert_eq!(config.send_interval(), Duration::from_secs(3));

        let config = DispatcherConfig {
            max_messages_per_minute: 0,
        };
        assert_eq!(config.send_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_growth_and_reset() {
        let reconnect = ReconnectConfig::default();
        let mut delay = reconnect.backoff_floor;
        for _ in 0..20 {
            delay = reconnect.next_backoff(delay, false);
        }
        assert_eq!(delay, Duration::from_secs(30));

        assert_eq!(
            reconnect.next_backoff(Duration::from_secs(2), false),
            Duration::from_secs(4)
        );
        assert_eq!(reconnect.next_backoff(delay, true), Duration::from_secs(2));
    }

    #[test]
    fn test_config_builder() {
        let config = GatewayConfigBuilder::new()
            .broker("mqtt.example.org", 8883)
            .credentials("gw", "secret")
            .tls(true)
            .ca_file("/etc/meshlink/broker.pem")
            .persistent_session()
            .max_messages_per_minute(12)
            .gateway_id("!a1b2c3d4")
            .build();

        assert_eq!(config.link.host, "mqtt.example.org");
        assert!(config.link.use_tls);
        assert!(config.link.accept_untrusted_certs);
        assert_eq!(
            config.link.ca_file.as_deref(),
            Some(Path::new("/etc/meshlink/broker.pem"))
        );
        assert_eq!(config.link.ack_timeout, Duration::from_secs(10));
        assert!(!config.link.clean_session);
        assert_eq!(config.dispatcher.send_interval(), Duration::from_secs(5));
        assert_eq!(config.mesh.node_number().unwrap(), 0xa1b2c3d4);
    }

    #[test]
    fn test_invalid_gateway_id() {
        let mut mesh = MeshConfig::default();
        mesh.gateway_id = "gateway".to_string();
        assert!(mesh.node_number().is_err());
    }

    #[test]
    fn test_humantime_fields_from_json() {
        let json = r#"{
            "admission": { "dedup_ttl": "90s" },
            "session": { "chat_state_ttl": "5m", "max_code_attempts": 3 }
        }"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.admission.dedup_ttl, Duration::from_secs(90));
        assert_eq!(config.session.chat_state_ttl, Duration::from_secs(300));
        assert_eq!(config.session.max_code_attempts, 3);
        assert_eq!(config.session.code_ttl, DEFAULT_CODE_TTL);
    }
}
