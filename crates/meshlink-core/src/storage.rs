//! Persistent registration storage boundary
//!
//! The gateway core reads and writes device records, chat-to-device links,
//! channels and gateway registrations through [`RegistrationStorage`]. Each
//! operation touches a single entity; no cross-entity transactions are
//! required. [`MemoryStorage`] is the in-process implementation used by
//! tests and single-node deployments; the SQLite implementation lives in
//! `meshlink-state`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;

/// A registered mesh device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Mesh node number
    pub id: u32,
    /// Curve25519 public key, 32 bytes
    pub public_key: Vec<u8>,
    /// Display name learned from node-info packets
    pub name: Option<String>,
    /// First registration
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// New record stamped with the current time
    pub fn new(id: u32, public_key: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id,
            public_key,
            name: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Link between a chat and a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLink {
    /// Chat the device relays into
    pub chat_id: i64,
    /// Linked device
    pub device_id: u32,
    /// Chat user who completed the registration
    pub owner_user_id: i64,
    /// Last time the link was (re)confirmed
    pub linked_at: DateTime<Utc>,
}

/// A pre-shared-key channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Storage id
    pub id: i64,
    /// Channel name
    pub name: String,
    /// Pre-shared key as configured (0, 1, 16 or 32 bytes)
    pub key: Vec<u8>,
    /// XOR hash of name and expanded key
    pub xor_hash: u8,
    /// Channel is only used by a single device
    pub single_device: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A gateway node known to this deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRecord {
    /// Node id string of the gateway (`!1234abcd`)
    pub gateway_id: String,
    /// Chat user that registered the gateway
    pub owner_user_id: i64,
    /// Last status heartbeat
    pub last_seen: DateTime<Utc>,
}

/// Whether an upsert created a row or refreshed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    /// Row did not exist before
    Inserted,
    /// Existing row was updated
    Updated,
}

/// Create/read/update/delete operations on registration entities
#[async_trait]
pub trait RegistrationStorage: Send + Sync {
    /// Look up a device
    async fn get_device(&self, device_id: u32) -> Result<Option<DeviceRecord>>;

    /// Insert or replace a device record
    async fn upsert_device(&self, device: &DeviceRecord) -> Result<()>;

    /// Insert a chat-device link, or refresh owner and timestamp
    async fn upsert_device_link(
        &self,
        chat_id: i64,
        device_id: u32,
        owner_user_id: i64,
    ) -> Result<LinkChange>;

    /// Remove one chat-device link; `false` if it did not exist
    async fn remove_device_link(&self, chat_id: i64, device_id: u32) -> Result<bool>;

    /// Remove a device from every chat, returning how many links were removed
    async fn remove_device_from_all(&self, device_id: u32) -> Result<usize>;

    /// Devices linked to a chat
    async fn devices_for_chat(&self, chat_id: i64) -> Result<Vec<DeviceLink>>;

    /// Chats a device is linked to
    async fn chats_for_device(&self, device_id: u32) -> Result<Vec<i64>>;

    /// Find a channel by name and key, creating it if absent
    async fn upsert_channel(
        &self,
        name: &str,
        key: &[u8],
        xor_hash: u8,
        single_device: bool,
    ) -> Result<ChannelRecord>;

    /// Channels whose hash matches
    async fn channels_by_hash(&self, xor_hash: u8) -> Result<Vec<ChannelRecord>>;

    /// Link a chat to a channel
    async fn upsert_channel_link(&self, chat_id: i64, channel_id: i64) -> Result<LinkChange>;

    /// Chats linked to a channel
    async fn chats_for_channel(&self, channel_id: i64) -> Result<Vec<i64>>;

    /// Insert or refresh a gateway registration
    async fn upsert_gateway(&self, gateway: &GatewayRecord) -> Result<()>;

    /// Look up a gateway registration
    async fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>>;

    /// Every registered gateway, ordered by id
    async fn list_gateways(&self) -> Result<Vec<GatewayRecord>>;
}

#[derive(Default)]
struct MemoryInner {
    devices: HashMap<u32, DeviceRecord>,
    device_links: BTreeMap<(i64, u32), DeviceLink>,
    channels: BTreeMap<i64, ChannelRecord>,
    channel_links: BTreeMap<(i64, i64), DateTime<Utc>>,
    gateways: HashMap<String, GatewayRecord>,
    next_channel_id: i64,
}

/// In-memory [`RegistrationStorage`]
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chat-device links
    pub fn device_link_count(&self) -> usize {
        self.inner.read().device_links.len()
    }

    /// Number of stored devices
    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }
}

#[async_trait]
impl RegistrationStorage for MemoryStorage {
    async fn get_device(&self, device_id: u32) -> Result<Option<DeviceRecord>> {
        Ok(self.inner.read().devices.get(&device_id).cloned())
    }

    async fn upsert_device(&self, device: &DeviceRecord) -> Result<()> {
        self.inner.write().devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn upsert_device_link(
        &self,
        chat_id: i64,
        device_id: u32,
        owner_user_id: i64,
    ) -> Result<LinkChange> {
        let link = DeviceLink {
            chat_id,
            device_id,
            owner_user_id,
            linked_at: Utc::now(),
        };
        let previous = self
            .inner
            .write()
            .device_links
            .insert((chat_id, device_id), link);
        Ok(match previous {
            Some(_) => LinkChange::Updated,
            None => LinkChange::Inserted,
        })
    }

    async fn remove_device_link(&self, chat_id: i64, device_id: u32) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .device_links
            .remove(&(chat_id, device_id))
            .is_some())
    }

    async fn remove_device_from_all(&self, device_id: u32) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.device_links.len();
        inner.device_links.retain(|(_, id), _| *id != device_id);
        Ok(before - inner.device_links.len())
    }

    async fn devices_for_chat(&self, chat_id: i64) -> Result<Vec<DeviceLink>> {
        Ok(self
            .inner
            .read()
            .device_links
            .range((chat_id, u32::MIN)..=(chat_id, u32::MAX))
            .map(|(_, link)| link.clone())
            .collect())
    }

    async fn chats_for_device(&self, device_id: u32) -> Result<Vec<i64>> {
        Ok(self
            .inner
            .read()
            .device_links
            .keys()
            .filter(|(_, id)| *id == device_id)
            .map(|(chat, _)| *chat)
            .collect())
    }

    async fn upsert_channel(
        &self,
        name: &str,
        key: &[u8],
        xor_hash: u8,
        single_device: bool,
    ) -> Result<ChannelRecord> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner
            .channels
            .values()
            .find(|c| c.name == name && c.key == key)
        {
            return Ok(existing.clone());
        }
        inner.next_channel_id += 1;
        let record = ChannelRecord {
            id: inner.next_channel_id,
            name: name.to_string(),
            key: key.to_vec(),
            xor_hash,
            single_device,
            created_at: Utc::now(),
        };
        inner.channels.insert(record.id, record.clone());
        Ok(record)
    }

    async fn channels_by_hash(&self, xor_hash: u8) -> Result<Vec<ChannelRecord>> {
        Ok(self
            .inner
            .read()
            .channels
            .values()
            .filter(|c| c.xor_hash == xor_hash)
            .cloned()
            .collect())
    }

    async fn upsert_channel_link(&self, chat_id: i64, channel_id: i64) -> Result<LinkChange> {
        let previous = self
            .inner
            .write()
            .channel_links
            .insert((chat_id, channel_id), Utc::now());
        Ok(match previous {
            Some(_) => LinkChange::Updated,
            None => LinkChange::Inserted,
        })
    }

    async fn chats_for_channel(&self, channel_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .inner
            .read()
            .channel_links
            .keys()
            .filter(|(_, id)| *id == channel_id)
            .map(|(chat, _)| *chat)
            .collect())
    }

    async fn upsert_gateway(&self, gateway: &GatewayRecord) -> Result<()> {
        self.inner
            .write()
            .gateways
            .insert(gateway.gateway_id.clone(), gateway.clone());
        Ok(())
    }

    async fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>> {
        Ok(self.inner.read().gateways.get(gateway_id).cloned())
    }

    async fn list_gateways(&self) -> Result<Vec<GatewayRecord>> {
        let mut gateways: Vec<GatewayRecord> =
            self.inner.read().gateways.values().cloned().collect();
        gateways.sort_by(|a, b| a.gateway_id.cmp(&b.gateway_id));
        Ok(gateways)
    }
}
