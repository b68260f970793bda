//! Registration and conversation state
//!
//! [`SessionStore`] tracks, per (chat user, chat) pair, where a multi-step
//! conversation currently is and which one-time code is outstanding. It also
//! fronts persistent device records with a read-through, write-through
//! cache.
//!
//! Verification outcomes are plain values ([`CodeVerification`]); only
//! storage failures surface as errors.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{SessionConfig, PUBLIC_KEY_LEN};
use crate::error::{LinkError, Result};
use crate::storage::{DeviceRecord, LinkChange, RegistrationStorage};
use crate::store::TtlStore;

/// Expired codes stay readable this long so a late attempt reports
/// `Expired` rather than `NotFound`.
const EXPIRED_CODE_GRACE: Duration = Duration::from_secs(10 * 60);

/// Conversation key: one chat user inside one chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatKey {
    /// Chat platform user id
    pub user_id: i64,
    /// Chat id
    pub chat_id: i64,
}

impl ChatKey {
    /// Create a key
    pub fn new(user_id: i64, chat_id: i64) -> Self {
        Self { user_id, chat_id }
    }
}

/// Where a conversation currently is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChatState {
    /// No flow in progress
    #[default]
    Default,
    /// Waiting for the device id to add
    AddingDeviceNeedId,
    /// Waiting for the code sent to the device
    AddingDeviceNeedCode,
    /// Waiting for a channel name
    AddingChannelNeedName,
    /// Waiting for the channel key
    AddingChannelNeedKey {
        /// Name entered in the previous step
        name: String,
    },
    /// Waiting for the code sent over the channel
    AddingChannelNeedCode,
    /// Waiting for the device to unlink from this chat
    RemovingDevice,
    /// Waiting for the device to unlink from every chat
    RemovingDeviceFromAll,
    /// Administrative conversation
    Admin,
}

/// Channel being registered alongside a code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChannel {
    /// Channel name
    pub name: String,
    /// Channel pre-shared key
    pub key: Vec<u8>,
}

/// An outstanding one-time code
#[derive(Debug, Clone)]
pub struct PendingCode {
    /// Six-digit code
    pub code: String,
    /// Device the code was sent to
    pub device_id: u32,
    /// Channel payload for channel registrations
    pub channel: Option<PendingChannel>,
    /// Verification attempts so far
    pub attempts: u32,
    /// Instant after which the code is no longer accepted
    pub expires_at: Instant,
}

/// Outcome of a code verification attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeVerification {
    /// Code matched; the device is linked to the chat
    Verified {
        /// Linked device
        device_id: u32,
        /// Channel payload carried by the code, if any
        channel: Option<PendingChannel>,
        /// Whether the link was created or refreshed
        change: LinkChange,
    },
    /// No outstanding code for this conversation
    NotFound,
    /// The code has expired
    Expired,
    /// The attempt limit was reached; the code is gone
    TooManyAttempts,
    /// Wrong code
    Mismatch {
        /// Attempts left before the code is discarded
        remaining: u32,
    },
}

impl CodeVerification {
    /// Check if verification succeeded
    pub fn is_verified(&self) -> bool {
        matches!(self, CodeVerification::Verified { .. })
    }
}

enum Attempt {
    Expired,
    Exhausted { matched: bool },
    Checked { record: PendingCode, matched: bool },
}

/// Generate a uniformly random six-digit code, zero padded
pub fn generate_code() -> String {
    let value: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{value:06}")
}

fn codes_match(stored: &str, submitted: &str) -> bool {
    stored.trim().eq_ignore_ascii_case(submitted.trim())
}

/// Conversation state, pending codes and the device cache
pub struct SessionStore {
    config: SessionConfig,
    storage: Arc<dyn RegistrationStorage>,
    states: TtlStore<ChatKey, ChatState>,
    codes: TtlStore<ChatKey, PendingCode>,
    devices: TtlStore<u32, DeviceRecord>,
}

impl SessionStore {
    /// Create a store backed by `storage`
    pub fn new(config: SessionConfig, storage: Arc<dyn RegistrationStorage>) -> Self {
        Self {
            states: TtlStore::new(config.chat_state_ttl),
            codes: TtlStore::new(config.code_ttl + EXPIRED_CODE_GRACE),
            devices: TtlStore::with_capacity(config.device_cache_capacity, config.device_cache_ttl),
            storage,
            config,
        }
    }

    /// The backing storage
    pub fn storage(&self) -> &Arc<dyn RegistrationStorage> {
        &self.storage
    }

    /// Current conversation state, `Default` when none is stored
    pub fn chat_state(&self, key: ChatKey) -> ChatState {
        self.states.get(&key).unwrap_or_default()
    }

    /// Move a conversation to `state`
    ///
    /// `Default` deletes the record; any other state restarts the
    /// inactivity window.
    pub fn set_chat_state(&self, key: ChatKey, state: ChatState) {
        debug!(user = key.user_id, chat = key.chat_id, state = ?state, "Chat state change");
        if state == ChatState::Default {
            self.states.remove(&key);
        } else {
            self.states.insert(key, state);
        }
    }

    /// Store a fresh code, replacing any outstanding one for `key`
    pub fn store_pending_code(
        &self,
        key: ChatKey,
        code: impl Into<String>,
        device_id: u32,
        channel: Option<PendingChannel>,
        valid_for: Duration,
    ) {
        let record = PendingCode {
            code: code.into(),
            device_id,
            channel,
            attempts: 0,
            expires_at: Instant::now() + valid_for,
        };
        self.codes
            .insert_with_ttl(key, record, valid_for + EXPIRED_CODE_GRACE);
    }

    /// Generate and store a code with the configured lifetime
    pub fn issue_code(
        &self,
        key: ChatKey,
        device_id: u32,
        channel: Option<PendingChannel>,
    ) -> String {
        let code = generate_code();
        self.store_pending_code(key, code.clone(), device_id, channel, self.config.code_ttl);
        code
    }

    /// The outstanding code for `key`, if any
    pub fn pending_code(&self, key: ChatKey) -> Option<PendingCode> {
        self.codes.get(&key)
    }

    /// Drop the outstanding code for `key`
    pub fn clear_pending_code(&self, key: ChatKey) {
        self.codes.remove(&key);
    }

    /// Check a submitted code
    ///
    /// The attempt counter is incremented before comparing, so a correct
    /// code on the attempt that reaches the limit is still rejected.
    pub async fn try_verify_code(&self, key: ChatKey, submitted: &str) -> Result<CodeVerification> {
        let max_attempts = self.config.max_code_attempts.max(1);
        let now = Instant::now();

        let attempt = self.codes.update(&key, |record| {
            if now >= record.expires_at {
                return Attempt::Expired;
            }
            record.attempts += 1;
            let matched = codes_match(&record.code, submitted);
            if record.attempts >= max_attempts {
                Attempt::Exhausted { matched }
            } else {
                Attempt::Checked {
                    record: record.clone(),
                    matched,
                }
            }
        });

        match attempt {
            None => Ok(CodeVerification::NotFound),
            Some(Attempt::Expired) => Ok(CodeVerification::Expired),
            Some(Attempt::Exhausted { matched }) => {
                self.codes.remove(&key);
                info!(user = key.user_id, chat = key.chat_id, "Code attempts exhausted");
                Ok(if matched {
                    CodeVerification::TooManyAttempts
                } else {
                    CodeVerification::Mismatch { remaining: 0 }
                })
            }
            Some(Attempt::Checked {
                record,
                matched: false,
            }) => Ok(CodeVerification::Mismatch {
                remaining: max_attempts - record.attempts,
            }),
            Some(Attempt::Checked {
                record,
                matched: true,
            }) => {
                let change = self
                    .storage
                    .upsert_device_link(key.chat_id, record.device_id, key.user_id)
                    .await?;
                self.codes.remove(&key);
                info!(
                    chat = key.chat_id,
                    device = record.device_id,
                    change = ?change,
                    "Device linked"
                );
                Ok(CodeVerification::Verified {
                    device_id: record.device_id,
                    channel: record.channel,
                    change,
                })
            }
        }
    }

    /// Device record, read through the cache
    pub async fn get_device(&self, device_id: u32) -> Result<Option<DeviceRecord>> {
        if let Some(device) = self.devices.get(&device_id) {
            return Ok(Some(device));
        }
        let device = self.storage.get_device(device_id).await?;
        if let Some(device) = &device {
            self.devices.insert(device_id, device.clone());
        }
        Ok(device)
    }

    /// Store a device record, writing through the cache
    ///
    /// Keys that are not exactly 32 bytes are rejected before anything is
    /// written.
    pub async fn set_device(&self, device: DeviceRecord) -> Result<()> {
        if device.public_key.len() != PUBLIC_KEY_LEN {
            return Err(LinkError::InvalidPublicKey {
                len: device.public_key.len(),
            });
        }
        self.storage.upsert_device(&device).await?;
        self.devices.insert(device.id, device);
        Ok(())
    }

    /// Drop a device from the cache so the next read goes to storage
    pub fn invalidate_device(&self, device_id: u32) {
        self.devices.remove(&device_id);
    }

    /// Remove expired states, codes and cached devices
    pub fn purge_expired(&self) -> usize {
        self.states.purge_expired() + self.codes.purge_expired() + self.devices.purge_expired()
    }
}
