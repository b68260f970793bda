//! Mesh envelope wire types
//!
//! Gateways forward mesh traffic to MQTT wrapped in a `ServiceEnvelope`
//! protobuf. Only the fields the gateway reads or writes are modelled; the
//! tags match the Meshtastic `mesh.proto`/`mqtt.proto` definitions so
//! unknown fields from newer firmware are skipped by prost.
//!
//! Encryption itself (channel AES, PKI) lives behind [`PacketCodec`].

use bytes::Bytes;
use prost::Message;

use crate::admission::Recipient;
use crate::error::{LinkError, Result};

/// Destination address meaning "every node"
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Meshtastic default channel key, selected by the one-byte key `0x01`
pub const DEFAULT_CHANNEL_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// Application port carried in `Data.portnum`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    /// Unknown/invalid port
    UnknownApp = 0,
    /// UTF-8 text message
    TextMessageApp = 1,
    /// Position report
    PositionApp = 3,
    /// Node info (user record)
    NodeinfoApp = 4,
    /// Routing protocol messages, including acks
    RoutingApp = 5,
    /// Admin messages
    AdminApp = 6,
    /// Telemetry data
    TelemetryApp = 67,
    /// Traceroute
    TracerouteApp = 70,
}

/// Decrypted payload of a mesh packet
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    /// Application port
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    /// Application payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    /// Sender asks for a reply
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    /// Final destination for multi-hop requests
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    /// Original sender for multi-hop requests
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    /// Packet id this packet answers (acks)
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    /// Packet id this text replies to
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    /// Emoji reaction flag
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

/// Payload of a mesh packet, either decoded or still encrypted
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum PayloadVariant {
    /// Plaintext payload
    #[prost(message, tag = "4")]
    Decoded(Data),
    /// Encrypted payload bytes
    #[prost(bytes, tag = "5")]
    Encrypted(Vec<u8>),
}

/// A packet travelling over the mesh
#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    /// Sender node number
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    /// Destination node number ([`BROADCAST_ADDR`] for channel traffic)
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    /// Channel hash on the air, channel index locally
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    /// Payload
    #[prost(oneof = "PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<PayloadVariant>,
    /// Packet id used for deduplication and acks
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    /// Receive time (unix seconds)
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    /// Remaining hops
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    /// Sender wants an ack
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    /// Packet reached MQTT through another gateway
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    /// Hop limit the packet started with
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    /// Sender public key (PKI packets)
    #[prost(bytes = "vec", tag = "16")]
    pub public_key: Vec<u8>,
    /// Payload is encrypted to the recipient's public key
    #[prost(bool, tag = "17")]
    pub pki_encrypted: bool,
}

/// MQTT wrapper around a mesh packet
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceEnvelope {
    /// The wrapped packet
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    /// Channel name (or "PKI")
    #[prost(string, tag = "2")]
    pub channel_id: String,
    /// Node id of the forwarding gateway
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

/// Position report payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct Position {
    /// Latitude * 1e7
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    /// Longitude * 1e7
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    /// Altitude in meters
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
}

/// Node-info payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    /// Node id string (`!1234abcd`)
    #[prost(string, tag = "1")]
    pub id: String,
    /// Display name
    #[prost(string, tag = "2")]
    pub long_name: String,
    /// Four-character name
    #[prost(string, tag = "3")]
    pub short_name: String,
    /// Node public key
    #[prost(bytes = "vec", tag = "8")]
    pub public_key: Vec<u8>,
}

/// Routing payload; only the error reason matters for acks
#[derive(Clone, PartialEq, prost::Message)]
pub struct Routing {
    /// 0 means delivered
    #[prost(int32, optional, tag = "3")]
    pub error_reason: Option<i32>,
}

impl ServiceEnvelope {
    /// Decode an envelope received from MQTT
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }

    /// Encode for publishing
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// The wrapped packet, which every useful envelope carries
    pub fn require_packet(&self) -> Result<&MeshPacket> {
        self.packet
            .as_ref()
            .ok_or_else(|| LinkError::InvalidEnvelope("envelope has no packet".to_string()))
    }
}

impl MeshPacket {
    /// Check if this packet is addressed to every node
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }

    /// Decoded payload, if the packet is not encrypted
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload_variant {
            Some(PayloadVariant::Decoded(data)) => Some(data),
            _ => None,
        }
    }

    /// Encrypted payload bytes, if any
    pub fn encrypted(&self) -> Option<&[u8]> {
        match &self.payload_variant {
            Some(PayloadVariant::Encrypted(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Build an outgoing packet with a random id
    pub fn outgoing(from: u32, to: u32, data: Data, want_ack: bool, hop_limit: u32) -> Self {
        Self {
            from,
            to,
            id: random_packet_id(),
            payload_variant: Some(PayloadVariant::Decoded(data)),
            want_ack,
            hop_limit,
            hop_start: hop_limit,
            ..Default::default()
        }
    }
}

impl Data {
    /// Text payload on the text port
    pub fn text(text: &str) -> Self {
        Self {
            portnum: PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    /// Payload as UTF-8 text, lossy
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Non-zero random packet id
pub fn random_packet_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// XOR of all bytes
pub fn xor_hash(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Expand a configured channel key to the key actually used on air
///
/// An empty key means no encryption, a single byte `n` selects the default
/// key with its last byte offset by `n - 1`, 16 and 32 byte keys are used
/// as-is.
pub fn expand_channel_key(key: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        0 => Ok(Vec::new()),
        1 => {
            let index = key[0];
            if index == 0 {
                return Ok(Vec::new());
            }
            let mut expanded = DEFAULT_CHANNEL_KEY.to_vec();
            if let Some(last) = expanded.last_mut() {
                *last = last.wrapping_add(index - 1);
            }
            Ok(expanded)
        }
        16 | 32 => Ok(key.to_vec()),
        len => Err(LinkError::InvalidConfig(format!(
            "channel key must be 0, 1, 16 or 32 bytes, got {len}"
        ))),
    }
}

/// Channel hash carried in `MeshPacket.channel` for channel traffic
pub fn channel_hash(name: &str, key: &[u8]) -> Result<u8> {
    let expanded = expand_channel_key(key)?;
    Ok(xor_hash(name.as_bytes()) ^ xor_hash(&expanded))
}

/// Format a node number as `!1234abcd`
pub fn format_node_id(node: u32) -> String {
    format!("!{node:08x}")
}

/// Parse `!1234abcd`, `0x1234abcd` or a decimal node number
pub fn parse_node_id(input: &str) -> Option<u32> {
    let trimmed = input.trim();
    if let Some(hex) = trimmed.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u32::from_str_radix(hex, 16).ok();
    }
    trimmed.parse().ok()
}

/// Encryption boundary for mesh payloads
///
/// Channel AES and PKI implementations plug in here; the gateway core only
/// decides which recipients are worth trying and in what order.
pub trait PacketCodec: Send + Sync {
    /// Try to decrypt `packet` as addressed to `recipient`
    fn decrypt(&self, packet: &MeshPacket, recipient: &Recipient) -> Option<Data>;

    /// Encrypt a decoded packet for `recipient`
    fn encrypt(&self, packet: MeshPacket, recipient: &Recipient) -> Result<MeshPacket>;
}

/// Codec that carries payloads as serialized `Data` without encryption
///
/// Useful against brokers that only see unencrypted test traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCodec;

impl PacketCodec for PlaintextCodec {
    fn decrypt(&self, packet: &MeshPacket, _recipient: &Recipient) -> Option<Data> {
        match &packet.payload_variant {
            Some(PayloadVariant::Decoded(data)) => Some(data.clone()),
            Some(PayloadVariant::Encrypted(bytes)) => Data::decode(bytes.as_slice()).ok(),
            None => None,
        }
    }

    fn encrypt(&self, mut packet: MeshPacket, recipient: &Recipient) -> Result<MeshPacket> {
        let data = match packet.payload_variant.take() {
            Some(PayloadVariant::Decoded(data)) => data,
            Some(encrypted @ PayloadVariant::Encrypted(_)) => {
                packet.payload_variant = Some(encrypted);
                return Ok(packet);
            }
            None => return Err(LinkError::InvalidEnvelope("packet has no payload".to_string())),
        };
        packet.channel = u32::from(recipient.xor_hash());
        packet.pki_encrypted = recipient.is_direct();
        packet.payload_variant = Some(PayloadVariant::Encrypted(data.encode_to_vec()));
        Ok(packet)
    }
}
