//! Inbound mesh traffic
//!
//! Envelopes from the mesh topic are admitted once per packet id,
//! classified, opened with the candidate keys and acted on by port: text
//! is relayed to linked chats, node info refreshes the device record,
//! routing reports and positions are logged.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use meshlink_core::{
    candidate_recipients, classify, format_node_id, AddressClass, Data, DeduplicationCache,
    DeviceRecord, MeshPacket, MessageHandler, PacketCodec, PortNum, Position, Recipient, Routing,
    ServiceEnvelope, SessionStore, User, PUBLIC_KEY_LEN,
};
use parking_lot::RwLock;
use prost::Message;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::notifier::ChatNotifier;
use crate::status::GatewayTracker;

/// Inbound mesh counters
#[derive(Debug, Clone, Default)]
pub struct MeshStats {
    /// Envelopes handed to the router
    pub received: u64,
    /// Packets already seen inside the dedup window
    pub duplicates: u64,
    /// Packets no stored key could decrypt
    pub undecodable: u64,
    /// Text messages forwarded to chats
    pub relayed: u64,
    /// Device records created or refreshed from node info
    pub nodeinfo_updates: u64,
}

/// Handles service envelopes arriving on the mesh topic
pub struct MeshRouter {
    sessions: Arc<SessionStore>,
    dedup: DeduplicationCache,
    codec: Arc<dyn PacketCodec>,
    notifier: Arc<dyn ChatNotifier>,
    tracker: Arc<GatewayTracker>,
    gateway_node: u32,
    stats: RwLock<MeshStats>,
}

impl MeshRouter {
    /// Create a router; duplicates are tracked in `dedup`
    pub fn new(
        sessions: Arc<SessionStore>,
        dedup: DeduplicationCache,
        codec: Arc<dyn PacketCodec>,
        notifier: Arc<dyn ChatNotifier>,
        tracker: Arc<GatewayTracker>,
        gateway_node: u32,
    ) -> Self {
        Self {
            sessions,
            dedup,
            codec,
            notifier,
            tracker,
            gateway_node,
            stats: RwLock::new(MeshStats::default()),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MeshStats {
        self.stats.read().clone()
    }

    /// Process one envelope
    pub async fn on_envelope(&self, envelope: ServiceEnvelope) -> anyhow::Result<()> {
        let packet = envelope.require_packet()?;
        self.stats.write().received += 1;
        if !envelope.gateway_id.is_empty() {
            self.tracker.touch(&envelope.gateway_id);
        }
        if packet.from == self.gateway_node {
            trace!(packet_id = packet.id, "Own packet echoed back");
            return Ok(());
        }
        if !self.dedup.admit(packet.id).is_fresh() {
            self.stats.write().duplicates += 1;
            trace!(packet_id = packet.id, gateway = %envelope.gateway_id, "Duplicate packet");
            return Ok(());
        }

        let class = classify(packet);
        let Some((data, recipient)) = self.open(packet, class).await? else {
            self.stats.write().undecodable += 1;
            debug!(packet_id = packet.id, class = ?class, "No key opens packet");
            return Ok(());
        };
        self.on_data(packet, recipient.as_ref(), data).await
    }

    async fn open(
        &self,
        packet: &MeshPacket,
        class: AddressClass,
    ) -> anyhow::Result<Option<(Data, Option<Recipient>)>> {
        let candidates = match class {
            AddressClass::Empty => return Ok(None),
            AddressClass::Plain { .. } => {
                return Ok(packet.decoded().cloned().map(|data| (data, None)));
            }
            AddressClass::Direct { to } => {
                let device = self.sessions.get_device(to).await?;
                candidate_recipients(class, device.as_ref(), &[])
            }
            AddressClass::Channel { hash } => {
                let device = if packet.is_broadcast() {
                    None
                } else {
                    self.sessions.get_device(packet.to).await?
                };
                let channels = self.sessions.storage().channels_by_hash(hash).await?;
                candidate_recipients(class, device.as_ref(), &channels)
            }
        };

        Ok(candidates.into_iter().find_map(|recipient| {
            self.codec
                .decrypt(packet, &recipient)
                .map(|data| (data, Some(recipient)))
        }))
    }

    async fn on_data(
        &self,
        packet: &MeshPacket,
        recipient: Option<&Recipient>,
        data: Data,
    ) -> anyhow::Result<()> {
        match PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp) {
            PortNum::TextMessageApp => self.relay_text(packet, recipient, &data).await,
            PortNum::NodeinfoApp => self.update_node_info(packet.from, &data).await,
            PortNum::RoutingApp => {
                let routing = Routing::decode(data.payload.as_slice())?;
                info!(
                    from = %format_node_id(packet.from),
                    request_id = data.request_id,
                    error_reason = routing.error_reason.unwrap_or(0),
                    "Delivery report"
                );
                Ok(())
            }
            PortNum::PositionApp => {
                let position = Position::decode(data.payload.as_slice())?;
                debug!(
                    from = %format_node_id(packet.from),
                    latitude = position.latitude_i.map(|v| f64::from(v) / 1e7),
                    longitude = position.longitude_i.map(|v| f64::from(v) / 1e7),
                    "Position report"
                );
                Ok(())
            }
            port => {
                trace!(port = ?port, packet_id = packet.id, "Ignoring port");
                Ok(())
            }
        }
    }

    async fn relay_text(
        &self,
        packet: &MeshPacket,
        recipient: Option<&Recipient>,
        data: &Data,
    ) -> anyhow::Result<()> {
        let storage = self.sessions.storage();
        let chats = match recipient {
            Some(Recipient::Channel { id, .. }) => storage.chats_for_channel(*id).await?,
            _ => storage.chats_for_device(packet.from).await?,
        };
        if chats.is_empty() {
            debug!(from = %format_node_id(packet.from), "Text from unlinked sender");
            return Ok(());
        }

        let sender = self
            .sessions
            .get_device(packet.from)
            .await?
            .and_then(|d| d.name)
            .unwrap_or_else(|| format_node_id(packet.from));
        let text = format!("{}: {}", sender, data.text_lossy());
        for chat in &chats {
            if let Err(e) = self.notifier.send_text(*chat, &text).await {
                warn!(chat, "Relay to chat failed: {}", e);
            }
        }
        self.stats.write().relayed += 1;
        Ok(())
    }

    async fn update_node_info(&self, from: u32, data: &Data) -> anyhow::Result<()> {
        let user = User::decode(data.payload.as_slice())?;
        let existing = self.sessions.get_device(from).await?;
        let name = Some(user.long_name.clone()).filter(|n| !n.is_empty());

        let record = match existing {
            Some(mut device) => {
                let key_changed = user.public_key.len() == PUBLIC_KEY_LEN
                    && user.public_key != device.public_key;
                if !key_changed && device.name == name {
                    return Ok(());
                }
                if key_changed {
                    device.public_key = user.public_key;
                }
                device.name = name;
                device.updated_at = Utc::now();
                device
            }
            None if user.public_key.len() == PUBLIC_KEY_LEN => {
                let mut device = DeviceRecord::new(from, user.public_key);
                device.name = name;
                device
            }
            None => {
                debug!(from = %format_node_id(from), "Node info without usable key");
                return Ok(());
            }
        };

        self.sessions.set_device(record).await?;
        self.stats.write().nodeinfo_updates += 1;
        info!(node = %format_node_id(from), name = %user.long_name, "Device record updated");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for MeshRouter {
    async fn handle(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        let envelope = ServiceEnvelope::decode_bytes(&payload)?;
        trace!(topic = %topic, gateway = %envelope.gateway_id, "Mesh envelope");
        self.on_envelope(envelope).await
    }
}
