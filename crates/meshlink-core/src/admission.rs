//! Inbound admission: duplicate filtering and address classification
//!
//! The same mesh packet usually reaches MQTT through several gateways. The
//! [`DeduplicationCache`] makes sure each packet id is processed at most once
//! per window. Each id has its own TTL; ids are not evicted in FIFO order.
//!
//! Classification decides which keys the decoder should try on a packet:
//! an exact device key for PKI traffic comes first, channel keys matching
//! the packet's XOR hash after it.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::AdmissionConfig;
use crate::envelope::{MeshPacket, PayloadVariant};
use crate::storage::{ChannelRecord, DeviceRecord};
use crate::store::TtlStore;

/// Result of admitting a packet id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting inside the window, process it
    Fresh,
    /// Already seen inside the window, drop it
    Duplicate,
}

impl Admission {
    /// Check if the packet should be processed
    pub fn is_fresh(self) -> bool {
        matches!(self, Admission::Fresh)
    }
}

/// Admission statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct AdmissionStats {
    /// Total ids checked
    pub total_checks: u64,
    /// Ids rejected as duplicates
    pub duplicates_blocked: u64,
    /// Ids admitted
    pub fresh: u64,
    /// Entries removed by purge sweeps
    pub purged: u64,
}

impl AdmissionStats {
    /// Get the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_blocked as f64 / self.total_checks as f64
        }
    }
}

/// Packet-id cache with per-entry expiry
#[derive(Clone)]
pub struct DeduplicationCache {
    seen: Arc<TtlStore<u32, ()>>,
    stats: Arc<RwLock<AdmissionStats>>,
}

impl DeduplicationCache {
    /// Create from admission configuration
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::with_capacity_and_ttl(config.dedup_capacity, config.dedup_ttl)
    }

    /// Create with custom capacity and TTL
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: Arc::new(TtlStore::with_capacity(capacity, ttl)),
            stats: Arc::new(RwLock::new(AdmissionStats::default())),
        }
    }

    /// Record `packet_id` unless it was seen inside the window
    pub fn admit(&self, packet_id: u32) -> Admission {
        let fresh = self.seen.insert_if_absent(packet_id, ());

        let mut stats = self.stats.write();
        stats.total_checks += 1;
        if fresh {
            stats.fresh += 1;
            trace!(packet_id, "Packet admitted");
            Admission::Fresh
        } else {
            stats.duplicates_blocked += 1;
            debug!(packet_id, "Duplicate packet dropped");
            Admission::Duplicate
        }
    }

    /// Drop expired ids, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let purged = self.seen.purge_expired();
        if purged > 0 {
            self.stats.write().purged += purged as u64;
            trace!(purged, "Expired packet ids purged");
        }
        purged
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if no ids are remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> AdmissionStats {
        self.stats.read().clone()
    }

    /// Get the configured window
    pub fn ttl(&self) -> Duration {
        self.seen.default_ttl()
    }
}

/// A key the decoder can try on a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A device addressed by its public key
    Device {
        /// Mesh node number
        id: u32,
        /// 32-byte public key
        key: Vec<u8>,
    },
    /// A channel addressed by its pre-shared key
    Channel {
        /// Storage id of the channel
        id: i64,
        /// XOR hash identifying the channel on air
        xor: u8,
        /// Pre-shared key
        key: Vec<u8>,
    },
}

impl Recipient {
    /// Numeric identifier (node number or channel id)
    pub fn id(&self) -> i64 {
        match self {
            Recipient::Device { id, .. } => i64::from(*id),
            Recipient::Channel { id, .. } => *id,
        }
    }

    /// Key material
    pub fn key(&self) -> &[u8] {
        match self {
            Recipient::Device { key, .. } | Recipient::Channel { key, .. } => key,
        }
    }

    /// Channel hash; direct messages travel on hash 0
    pub fn xor_hash(&self) -> u8 {
        match self {
            Recipient::Device { .. } => 0,
            Recipient::Channel { xor, .. } => *xor,
        }
    }

    /// Check if this is a direct (PKI) recipient
    pub fn is_direct(&self) -> bool {
        matches!(self, Recipient::Device { .. })
    }
}

impl From<&DeviceRecord> for Recipient {
    fn from(device: &DeviceRecord) -> Self {
        Recipient::Device {
            id: device.id,
            key: device.public_key.clone(),
        }
    }
}

impl From<&ChannelRecord> for Recipient {
    fn from(channel: &ChannelRecord) -> Self {
        Recipient::Channel {
            id: channel.id,
            xor: channel.xor_hash,
            key: channel.key.clone(),
        }
    }
}

/// How an inbound packet is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Payload is already decoded
    Plain {
        /// Destination node
        to: u32,
    },
    /// Encrypted to a device public key
    Direct {
        /// Destination node whose key decrypts the packet
        to: u32,
    },
    /// Encrypted with a channel pre-shared key
    Channel {
        /// Channel hash carried by the packet
        hash: u8,
    },
    /// Packet carries no payload at all
    Empty,
}

impl AddressClass {
    /// Check if the payload is PKI-encrypted
    pub fn is_pki(self) -> bool {
        matches!(self, AddressClass::Direct { .. })
    }

    /// Check if the payload must be decrypted before use
    pub fn is_encrypted(self) -> bool {
        matches!(self, AddressClass::Direct { .. } | AddressClass::Channel { .. })
    }
}

/// Classify a packet's addressing
///
/// PKI packets are flagged explicitly by newer firmware; older firmware
/// sends them on channel hash 0 to a unicast address.
pub fn classify(packet: &MeshPacket) -> AddressClass {
    match &packet.payload_variant {
        None => AddressClass::Empty,
        Some(PayloadVariant::Decoded(_)) => AddressClass::Plain { to: packet.to },
        Some(PayloadVariant::Encrypted(_)) => {
            if packet.pki_encrypted || (packet.channel == 0 && !packet.is_broadcast()) {
                AddressClass::Direct { to: packet.to }
            } else {
                AddressClass::Channel {
                    hash: (packet.channel & 0xff) as u8,
                }
            }
        }
    }
}

/// Ordered keys to try for a classified packet
///
/// `device` is the destination device record when known; `channels` are
/// channels whose hash matches the packet. Channels that do not match the
/// packet's hash are filtered out here too.
pub fn candidate_recipients(
    class: AddressClass,
    device: Option<&DeviceRecord>,
    channels: &[ChannelRecord],
) -> Vec<Recipient> {
    match class {
        AddressClass::Empty | AddressClass::Plain { .. } => Vec::new(),
        AddressClass::Direct { to } => device
            .filter(|d| d.id == to)
            .map(Recipient::from)
            .into_iter()
            .collect(),
        AddressClass::Channel { hash } => {
            let mut candidates: Vec<Recipient> = Vec::with_capacity(channels.len() + 1);
            if let Some(device) = device {
                candidates.push(Recipient::from(device));
            }
            candidates.extend(
                channels
                    .iter()
                    .filter(|c| c.xor_hash == hash)
                    .map(Recipient::from),
            );
            candidates
        }
    }
}
