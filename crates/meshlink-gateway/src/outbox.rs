//! Outgoing mesh messages
//!
//! Builds service envelopes for text addressed to a device or a channel,
//! runs them through the packet codec and hands them to the dispatcher.

use meshlink_core::{
    channel_hash, Data, DeviceRecord, Dispatcher, MeshPacket, PacketCodec,
    PendingChannel, Priority, QueuedMessage, Recipient, ServiceEnvelope, BROADCAST_ADDR,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Envelope channel id used for PKI traffic
pub const PKI_CHANNEL_ID: &str = "PKI";

/// Addresses, encodes and queues mesh text
pub struct MeshOutbox {
    dispatcher: Arc<Dispatcher>,
    codec: Arc<dyn PacketCodec>,
    topic: String,
    gateway_id: String,
    gateway_node: u32,
    hop_limit: u32,
}

impl MeshOutbox {
    /// Create an outbox publishing envelopes on `topic`
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        codec: Arc<dyn PacketCodec>,
        topic: impl Into<String>,
        gateway_id: impl Into<String>,
        gateway_node: u32,
        hop_limit: u32,
    ) -> Self {
        Self {
            dispatcher,
            codec,
            topic: topic.into(),
            gateway_id: gateway_id.into(),
            gateway_node,
            hop_limit,
        }
    }

    /// Node number the gateway sends from
    pub fn gateway_node(&self) -> u32 {
        self.gateway_node
    }

    /// Dispatcher the encoded envelopes are queued on
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Queue text for one device; returns the estimated wait
    pub fn send_direct(
        &self,
        device: &DeviceRecord,
        text: &str,
        priority: Priority,
    ) -> meshlink_core::Result<Duration> {
        self.send(
            &Recipient::from(device),
            device.id,
            PKI_CHANNEL_ID,
            text,
            priority,
        )
    }

    /// Queue text broadcast on a channel that is not stored yet
    ///
    /// Returns the estimated wait.
    pub fn send_pending_channel(
        &self,
        channel: &PendingChannel,
        text: &str,
        priority: Priority,
    ) -> meshlink_core::Result<Duration> {
        let recipient = Recipient::Channel {
            id: 0,
            xor: channel_hash(&channel.name, &channel.key)?,
            key: channel.key.clone(),
        };
        self.send(&recipient, BROADCAST_ADDR, &channel.name, text, priority)
    }

    fn send(
        &self,
        recipient: &Recipient,
        to: u32,
        channel_id: &str,
        text: &str,
        priority: Priority,
    ) -> meshlink_core::Result<Duration> {
        let packet = MeshPacket::outgoing(
            self.gateway_node,
            to,
            Data::text(text),
            recipient.is_direct(),
            self.hop_limit,
        );
        let packet_id = packet.id;
        let packet = self.codec.encrypt(packet, recipient)?;
        let envelope = ServiceEnvelope {
            packet: Some(packet),
            channel_id: channel_id.to_string(),
            gateway_id: self.gateway_id.clone(),
        };

        let wait = self.dispatcher.enqueue(
            QueuedMessage::new(self.topic.clone(), to, envelope.to_bytes()),
            priority,
        );
        debug!(
            packet_id,
            to,
            priority = ?priority,
            wait_ms = wait.as_millis() as u64,
            "Mesh text queued"
        );
        Ok(wait)
    }
}
