//! Meshlink gateway core
//!
//! Resilient message-gateway core linking a chat platform, an MQTT broker
//! and a Meshtastic LoRa mesh.
//!
//! # Architecture
//!
//! ```text
//!  chat webhook ─► LinkManager (ingest) ─► broker ─► LinkManager (gateway)
//!                                                        │
//!                                       DeduplicationCache / classify
//!                                                        │
//!                                  router ─► Dispatcher ─► LinkManager ─► mesh topic
//!                                    │
//!                               SessionStore ◄─► RegistrationStorage
//! ```
//!
//! - [`LinkManager`] owns the broker connection, buffers publishes across
//!   outages and routes inbound messages by topic.
//! - [`Dispatcher`] paces outgoing mesh traffic through three priority
//!   queues.
//! - [`DeduplicationCache`] drops packets already seen through another
//!   gateway; [`classify`] picks the keys worth trying on a packet.
//! - [`SessionStore`] drives the device/channel registration conversations
//!   and their one-time codes.
//! - [`Scheduler`] runs delayed and periodic work that is cancelled as a
//!   group at shutdown.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod store;

pub mod admission;
pub mod dispatcher;
pub mod envelope;
pub mod link;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod storage;

pub mod test_utils;

pub use config::{
    AdmissionConfig, DispatcherConfig, GatewayConfig, GatewayConfigBuilder, LinkConfig,
    MeshConfig, ReconnectConfig, SessionConfig, TopicConfig,
};
pub use error::{LinkError, Result};
pub use store::TtlStore;

pub use admission::{
    candidate_recipients, classify, AddressClass, Admission, AdmissionStats, DeduplicationCache,
    Recipient,
};
pub use dispatcher::{
    Dispatcher, DispatcherStats, MessageSink, Priority, QueueLens, QueuedMessage,
};
pub use envelope::{
    channel_hash, format_node_id, parse_node_id, Data, MeshPacket, PacketCodec, PlaintextCodec,
    PortNum, Position, Routing, ServiceEnvelope, User, BROADCAST_ADDR,
};
pub use link::mqtt::MqttConnector;
pub use link::{
    Connector, EventSink, LinkManager, LinkState, LinkStats, MessageHandler, PublishOutcome,
    Session, TransportEvent,
};
pub use scheduler::{Scheduler, TaskId};
pub use session::{
    generate_code, ChatKey, ChatState, CodeVerification, PendingChannel, PendingCode,
    SessionStore,
};
pub use status::{GatewaySeen, GatewayStatus, QueueDepths};
pub use storage::{
    ChannelRecord, DeviceLink, DeviceRecord, GatewayRecord, LinkChange, MemoryStorage,
    RegistrationStorage,
};

pub use config::{
    DEFAULT_CHAT_STATE_TTL, DEFAULT_CODE_TTL, DEFAULT_DEDUP_TTL, DEFAULT_HOP_LIMIT,
    DEFAULT_MAX_CODE_ATTEMPTS, DEFAULT_MAX_MESSAGES_PER_MINUTE, PUBLIC_KEY_LEN,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_DEDUP_TTL.as_secs(), 180);
        assert_eq!(DEFAULT_MAX_CODE_ATTEMPTS, 5);
        assert_eq!(PUBLIC_KEY_LEN, 32);
    }
}
