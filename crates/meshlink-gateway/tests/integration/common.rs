//! Shared fixtures

use async_trait::async_trait;
use bytes::Bytes;
use meshlink_core::test_utils::{MemoryStorage, MockBroker};
use meshlink_core::{
    ChatKey, Data, DeviceRecord, GatewayConfig, GatewayConfigBuilder, MeshPacket, PlaintextCodec,
    RegistrationStorage, ServiceEnvelope,
};
use meshlink_gateway::{ChatNotifier, Gateway};
use parking_lot::Mutex;
use prost::Message;
use serde_json::json;
use std::sync::Arc;

pub const GATEWAY_ID: &str = "!0000beef";
pub const GATEWAY_NODE: u32 = 0x0000_beef;
pub const DEVICE: u32 = 0x0000_abcd;
pub const USER: i64 = 42;
pub const CHAT: i64 = -1001;

pub fn key() -> ChatKey {
    ChatKey::new(USER, CHAT)
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingNotifier {
    pub fn replies(&self, chat: i64) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn last(&self, chat: i64) -> String {
        self.replies(chat).pop().unwrap_or_default()
    }
}

#[async_trait]
impl ChatNotifier for RecordingNotifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.sent.lock().push((chat_id, text.to_string()));
        Ok(())
    }
}

pub fn config() -> GatewayConfig {
    let mut config = GatewayConfigBuilder::new()
        .client_id("meshlink-gateway-test")
        .gateway_id(GATEWAY_ID)
        .max_messages_per_minute(60)
        .persistent_session()
        .build();
    config.topics.chat_updates = "chat/updates".to_string();
    config.topics.mesh = "msh/test".to_string();
    config.topics.status = "meshlink/status".to_string();
    config
}

pub struct Harness {
    pub broker: MockBroker,
    pub storage: Arc<MemoryStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub gateway: Gateway,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let broker = MockBroker::new();
        let storage = Arc::new(MemoryStorage::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Gateway::new(
            config,
            broker.connector(),
            storage.clone(),
            notifier.clone(),
            Arc::new(PlaintextCodec),
        )
        .unwrap();
        Self {
            broker,
            storage,
            notifier,
            gateway,
        }
    }

    pub async fn known_device(&self, id: u32, name: &str) {
        let mut device = DeviceRecord::new(id, vec![7u8; 32]);
        device.name = Some(name.to_string());
        self.storage.upsert_device(&device).await.unwrap();
    }

    pub async fn chat(&self, user: i64, chat: i64, text: &str) {
        self.gateway
            .chat_router()
            .on_update(serde_json::from_slice(&update(user, chat, text)).unwrap())
            .await
            .unwrap();
    }

    pub async fn envelope(&self, envelope: &ServiceEnvelope) -> anyhow::Result<()> {
        self.gateway
            .mesh_router()
            .on_envelope(envelope.clone())
            .await
    }

    /// Mesh packets the broker accepted, decoded
    pub fn mesh_published(&self) -> Vec<MeshPacket> {
        self.broker
            .published()
            .into_iter()
            .filter(|m| m.topic == "msh/test")
            .filter_map(|m| ServiceEnvelope::decode_bytes(&m.payload).ok())
            .filter_map(|e| e.packet)
            .collect()
    }
}

pub fn update(user: i64, chat: i64, text: &str) -> Bytes {
    let body = json!({
        "update_id": 1,
        "message": {
            "message_id": 1,
            "chat": {"id": chat, "type": "group"},
            "from": {"id": user, "is_bot": false, "first_name": "Ana"},
            "text": text
        }
    });
    Bytes::from(serde_json::to_vec(&body).unwrap())
}

/// Plain envelope forwarded by `gateway_id`
pub fn plain_envelope(from: u32, to: u32, id: u32, data: Data, gateway_id: &str) -> ServiceEnvelope {
    let mut packet = MeshPacket::outgoing(from, to, data, false, 3);
    packet.id = id;
    ServiceEnvelope {
        packet: Some(packet),
        channel_id: "LongFast".to_string(),
        gateway_id: gateway_id.to_string(),
    }
}

/// Text carried by an outgoing packet encoded with the plaintext codec
pub fn packet_text(packet: &MeshPacket) -> String {
    let bytes = packet.encrypted().unwrap_or_default();
    Data::decode(bytes).map(|d| d.text_lossy()).unwrap_or_default()
}
