//! SQLite-backed registration storage
//!
//! Timestamps are stored as RFC 3339 text, node numbers as integers. Each
//! operation touches one entity; upserts that report whether a row was
//! created run inside a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshlink_core::storage::{
    ChannelRecord, DeviceLink, DeviceRecord, GatewayRecord, LinkChange, RegistrationStorage,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Result, StateError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY,
        public_key BLOB NOT NULL,
        name TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS device_links (
        chat_id INTEGER NOT NULL,
        device_id INTEGER NOT NULL,
        owner_user_id INTEGER NOT NULL,
        linked_at TEXT NOT NULL,
        PRIMARY KEY (chat_id, device_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_device_links_device ON device_links(device_id)",
    "CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        psk BLOB NOT NULL,
        xor_hash INTEGER NOT NULL,
        single_device INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (name, psk)
    )",
    "CREATE INDEX IF NOT EXISTS idx_channels_hash ON channels(xor_hash)",
    "CREATE TABLE IF NOT EXISTS channel_links (
        chat_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL REFERENCES channels(id),
        linked_at TEXT NOT NULL,
        PRIMARY KEY (chat_id, channel_id)
    )",
    "CREATE TABLE IF NOT EXISTS gateways (
        gateway_id TEXT PRIMARY KEY,
        owner_user_id INTEGER NOT NULL,
        last_seen TEXT NOT NULL
    )",
];

/// SQLite registration store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "Registration database opened");
        Ok(store)
    }

    /// Open a private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StateError::Connection(e.to_string()))?;
        // Every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    /// The underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Look up a device
    pub async fn get_device(&self, device_id: u32) -> Result<Option<DeviceRecord>> {
        let row = sqlx::query(
            "SELECT id, public_key, name, created_at, updated_at FROM devices WHERE id = ?",
        )
        .bind(i64::from(device_id))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| device_from_row(&row)).transpose()
    }

    /// Insert or replace a device record, keeping the original creation time
    pub async fn upsert_device(&self, device: &DeviceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (id, public_key, name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                public_key = excluded.public_key,
                name = excluded.name,
                updated_at = excluded.updated_at",
        )
        .bind(i64::from(device.id))
        .bind(&device.public_key)
        .bind(&device.name)
        .bind(device.created_at.to_rfc3339())
        .bind(device.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a chat-device link, or refresh owner and timestamp
    pub async fn upsert_device_link(
        &self,
        chat_id: i64,
        device_id: u32,
        owner_user_id: i64,
    ) -> Result<LinkChange> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT 1 FROM device_links WHERE chat_id = ? AND device_id = ?")
            .bind(chat_id)
            .bind(i64::from(device_id))
            .fetch_optional(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO device_links (chat_id, device_id, owner_user_id, linked_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id, device_id) DO UPDATE SET
                owner_user_id = excluded.owner_user_id,
                linked_at = excluded.linked_at",
        )
        .bind(chat_id)
        .bind(i64::from(device_id))
        .bind(owner_user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if existing.is_some() {
            LinkChange::Updated
        } else {
            LinkChange::Inserted
        })
    }

    /// Remove one chat-device link
    pub async fn remove_device_link(&self, chat_id: i64, device_id: u32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_links WHERE chat_id = ? AND device_id = ?")
            .bind(chat_id)
            .bind(i64::from(device_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a device from every chat
    pub async fn remove_device_from_all(&self, device_id: u32) -> Result<usize> {
        let result = sqlx::query("DELETE FROM device_links WHERE device_id = ?")
            .bind(i64::from(device_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Devices linked to a chat
    pub async fn devices_for_chat(&self, chat_id: i64) -> Result<Vec<DeviceLink>> {
        let rows = sqlx::query(
            "SELECT chat_id, device_id, owner_user_id, linked_at FROM device_links
             WHERE chat_id = ? ORDER BY device_id",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_link_from_row).collect()
    }

    /// Chats a device is linked to
    pub async fn chats_for_device(&self, device_id: u32) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT chat_id FROM device_links WHERE device_id = ? ORDER BY chat_id")
            .bind(i64::from(device_id))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("chat_id").map_err(StateError::from))
            .collect()
    }

    /// Find a channel by name and key, creating it if absent
    pub async fn upsert_channel(
        &self,
        name: &str,
        key: &[u8],
        xor_hash: u8,
        single_device: bool,
    ) -> Result<ChannelRecord> {
        sqlx::query(
            "INSERT INTO channels (name, psk, xor_hash, single_device, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name, psk) DO NOTHING",
        )
        .bind(name)
        .bind(key)
        .bind(i64::from(xor_hash))
        .bind(single_device)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, name, psk, xor_hash, single_device, created_at FROM channels
             WHERE name = ? AND psk = ?",
        )
        .bind(name)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        channel_from_row(&row)
    }

    /// Channels whose hash matches
    pub async fn channels_by_hash(&self, xor_hash: u8) -> Result<Vec<ChannelRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, psk, xor_hash, single_device, created_at FROM channels
             WHERE xor_hash = ? ORDER BY id",
        )
        .bind(i64::from(xor_hash))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(channel_from_row).collect()
    }

    /// Link a chat to a channel
    pub async fn upsert_channel_link(&self, chat_id: i64, channel_id: i64) -> Result<LinkChange> {
        let mut tx = self.pool.begin().await?;
        let existing =
            sqlx::query("SELECT 1 FROM channel_links WHERE chat_id = ? AND channel_id = ?")
                .bind(chat_id)
                .bind(channel_id)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO channel_links (chat_id, channel_id, linked_at) VALUES (?, ?, ?)
             ON CONFLICT(chat_id, channel_id) DO UPDATE SET linked_at = excluded.linked_at",
        )
        .bind(chat_id)
        .bind(channel_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if existing.is_some() {
            LinkChange::Updated
        } else {
            LinkChange::Inserted
        })
    }

    /// Chats linked to a channel
    pub async fn chats_for_channel(&self, channel_id: i64) -> Result<Vec<i64>> {
        let rows =
            sqlx::query("SELECT chat_id FROM channel_links WHERE channel_id = ? ORDER BY chat_id")
                .bind(channel_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("chat_id").map_err(StateError::from))
            .collect()
    }

    /// Insert or refresh a gateway registration
    pub async fn upsert_gateway(&self, gateway: &GatewayRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateways (gateway_id, owner_user_id, last_seen) VALUES (?, ?, ?)
             ON CONFLICT(gateway_id) DO UPDATE SET
                owner_user_id = excluded.owner_user_id,
                last_seen = excluded.last_seen",
        )
        .bind(&gateway.gateway_id)
        .bind(gateway.owner_user_id)
        .bind(gateway.last_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a gateway registration
    pub async fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>> {
        let row = sqlx::query(
            "SELECT gateway_id, owner_user_id, last_seen FROM gateways WHERE gateway_id = ?",
        )
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| gateway_from_row(&row)).transpose()
    }

    /// Every registered gateway
    pub async fn list_gateways(&self) -> Result<Vec<GatewayRecord>> {
        let rows = sqlx::query(
            "SELECT gateway_id, owner_user_id, last_seen FROM gateways ORDER BY gateway_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(gateway_from_row).collect()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn node_id(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StateError::InvalidData(format!("node id out of range: {value}")))
}

fn device_from_row(row: &SqliteRow) -> Result<DeviceRecord> {
    Ok(DeviceRecord {
        id: node_id(row.try_get("id")?)?,
        public_key: row.try_get("public_key")?,
        name: row.try_get("name")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn device_link_from_row(row: &SqliteRow) -> Result<DeviceLink> {
    Ok(DeviceLink {
        chat_id: row.try_get("chat_id")?,
        device_id: node_id(row.try_get("device_id")?)?,
        owner_user_id: row.try_get("owner_user_id")?,
        linked_at: parse_timestamp(&row.try_get::<String, _>("linked_at")?)?,
    })
}

fn channel_from_row(row: &SqliteRow) -> Result<ChannelRecord> {
    let xor_hash: i64 = row.try_get("xor_hash")?;
    Ok(ChannelRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        key: row.try_get("psk")?,
        xor_hash: u8::try_from(xor_hash)
            .map_err(|_| StateError::InvalidData(format!("xor hash out of range: {xor_hash}")))?,
        single_device: row.try_get("single_device")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn gateway_from_row(row: &SqliteRow) -> Result<GatewayRecord> {
    Ok(GatewayRecord {
        gateway_id: row.try_get("gateway_id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        last_seen: parse_timestamp(&row.try_get::<String, _>("last_seen")?)?,
    })
}

#[async_trait]
impl RegistrationStorage for SqliteStore {
    async fn get_device(&self, device_id: u32) -> meshlink_core::Result<Option<DeviceRecord>> {
        Ok(SqliteStore::get_device(self, device_id).await?)
    }

    async fn upsert_device(&self, device: &DeviceRecord) -> meshlink_core::Result<()> {
        Ok(SqliteStore::upsert_device(self, device).await?)
    }

    async fn upsert_device_link(
        &self,
        chat_id: i64,
        device_id: u32,
        owner_user_id: i64,
    ) -> meshlink_core::Result<LinkChange> {
        Ok(SqliteStore::upsert_device_link(self, chat_id, device_id, owner_user_id).await?)
    }

    async fn remove_device_link(&self, chat_id: i64, device_id: u32) -> meshlink_core::Result<bool> {
        Ok(SqliteStore::remove_device_link(self, chat_id, device_id).await?)
    }

    async fn remove_device_from_all(&self, device_id: u32) -> meshlink_core::Result<usize> {
        Ok(SqliteStore::remove_device_from_all(self, device_id).await?)
    }

    async fn devices_for_chat(&self, chat_id: i64) -> meshlink_core::Result<Vec<DeviceLink>> {
        Ok(SqliteStore::devices_for_chat(self, chat_id).await?)
    }

    async fn chats_for_device(&self, device_id: u32) -> meshlink_core::Result<Vec<i64>> {
        Ok(SqliteStore::chats_for_device(self, device_id).await?)
    }

    async fn upsert_channel(
        &self,
        name: &str,
        key: &[u8],
        xor_hash: u8,
        single_device: bool,
    ) -> meshlink_core::Result<ChannelRecord> {
        Ok(SqliteStore::upsert_channel(self, name, key, xor_hash, single_device).await?)
    }

    async fn channels_by_hash(&self, xor_hash: u8) -> meshlink_core::Result<Vec<ChannelRecord>> {
        Ok(SqliteStore::channels_by_hash(self, xor_hash).await?)
    }

    async fn upsert_channel_link(
        &self,
        chat_id: i64,
        channel_id: i64,
    ) -> meshlink_core::Result<LinkChange> {
        Ok(SqliteStore::upsert_channel_link(self, chat_id, channel_id).await?)
    }

    async fn chats_for_channel(&self, channel_id: i64) -> meshlink_core::Result<Vec<i64>> {
        Ok(SqliteStore::chats_for_channel(self, channel_id).await?)
    }

    async fn upsert_gateway(&self, gateway: &GatewayRecord) -> meshlink_core::Result<()> {
        Ok(SqliteStore::upsert_gateway(self, gateway).await?)
    }

    async fn get_gateway(&self, gateway_id: &str) -> meshlink_core::Result<Option<GatewayRecord>> {
        Ok(SqliteStore::get_gateway(self, gateway_id).await?)
    }

    async fn list_gateways(&self) -> meshlink_core::Result<Vec<GatewayRecord>> {
        Ok(SqliteStore::list_gateways(self).await?)
    }
}
