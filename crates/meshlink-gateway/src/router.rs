//! Chat update router
//!
//! Drives the registration conversations and relays plain chat text to the
//! devices linked to the chat.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use meshlink_core::{
    channel_hash, format_node_id, parse_node_id, ChatKey, ChatState, CodeVerification,
    GatewayRecord, LinkChange, MessageHandler, PendingChannel, Priority, SessionStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chat::{ChatUser, Command, Update};
use crate::notifier::ChatNotifier;
use crate::outbox::MeshOutbox;

/// Longest channel name the mesh accepts
pub const MAX_CHANNEL_NAME_LEN: usize = 11;

/// Relays deferred at least this long are acknowledged in chat
const SLOW_RELAY_NOTICE: Duration = Duration::from_secs(30);

const HELP: &str = "Commands:\n\
/add_device [id] - link a mesh device to this chat\n\
/add_channel - link a mesh channel to this chat\n\
/remove_device [id] - unlink a device from this chat\n\
/remove_device_all [id] - unlink a device from every chat\n\
/add_gateway [id] - register a mesh gateway\n\
/devices - list linked devices\n\
/status - show queue depths\n\
/cancel - abort the current step\n\
Any other text is relayed to the linked devices.";

/// Handles chat updates arriving on the chat topic
pub struct ChatRouter {
    sessions: Arc<SessionStore>,
    outbox: Arc<MeshOutbox>,
    notifier: Arc<dyn ChatNotifier>,
}

impl ChatRouter {
    /// Create a router that answers through `notifier`
    pub fn new(
        sessions: Arc<SessionStore>,
        outbox: Arc<MeshOutbox>,
        notifier: Arc<dyn ChatNotifier>,
    ) -> Self {
        Self {
            sessions,
            outbox,
            notifier,
        }
    }

    /// Process one update
    pub async fn on_update(&self, update: Update) -> anyhow::Result<()> {
        let Some(message) = update.message else {
            return Ok(());
        };
        let (Some(user), Some(text)) = (message.from, message.text) else {
            return Ok(());
        };
        let key = ChatKey::new(user.id, message.chat.id);

        match Command::parse(&text) {
            Some(command) => self.on_command(key, command).await,
            None => self.on_text(key, &user, text.trim()).await,
        }
    }

    async fn on_command(&self, key: ChatKey, command: Command) -> anyhow::Result<()> {
        debug!(chat = key.chat_id, user = key.user_id, command = ?command, "Chat command");
        match command {
            Command::Start => {
                self.sessions.set_chat_state(key, ChatState::Default);
                self.reply(key, HELP).await;
            }
            Command::Cancel => {
                self.sessions.set_chat_state(key, ChatState::Default);
                self.sessions.clear_pending_code(key);
                self.reply(key, "Cancelled.").await;
            }
            Command::AddDevice(Some(id)) => self.begin_add_device(key, &id).await?,
            Command::AddDevice(None) => {
                self.sessions.set_chat_state(key, ChatState::AddingDeviceNeedId);
                self.reply(key, "Send the device id, for example !a1b2c3d4.").await;
            }
            Command::AddChannel => {
                self.sessions.set_chat_state(key, ChatState::AddingChannelNeedName);
                self.reply(key, "Send the channel name.").await;
            }
            Command::RemoveDevice(Some(id)) => self.remove_device(key, &id, false).await?,
            Command::RemoveDevice(None) => {
                self.sessions.set_chat_state(key, ChatState::RemovingDevice);
                self.reply(key, "Send the id of the device to unlink.").await;
            }
            Command::RemoveDeviceAll(Some(id)) => self.remove_device(key, &id, true).await?,
            Command::RemoveDeviceAll(None) => {
                self.sessions.set_chat_state(key, ChatState::RemovingDeviceFromAll);
                self.reply(key, "Send the id of the device to unlink everywhere.").await;
            }
            Command::AddGateway(Some(id)) => self.register_gateway(key, &id).await?,
            Command::AddGateway(None) => {
                self.sessions.set_chat_state(key, ChatState::Admin);
                self.reply(key, "Send the gateway node id.").await;
            }
            Command::Devices => self.list_devices(key).await?,
            Command::Status => {
                let queues = self.outbox.dispatcher().queue_lens();
                self.reply(
                    key,
                    format!(
                        "Queued for the mesh: {} high, {} normal, {} low.",
                        queues.high, queues.normal, queues.low
                    ),
                )
                .await;
            }
            Command::Unknown(name) => {
                self.reply(key, format!("Unknown command /{name}. Send /help for the list."))
                    .await;
            }
        }
        Ok(())
    }

    async fn on_text(&self, key: ChatKey, user: &ChatUser, text: &str) -> anyhow::Result<()> {
        match self.sessions.chat_state(key) {
            ChatState::Default => self.relay_to_devices(key, user, text).await,
            ChatState::AddingDeviceNeedId => self.begin_add_device(key, text).await,
            ChatState::AddingDeviceNeedCode | ChatState::AddingChannelNeedCode => {
                self.verify_code(key, text).await
            }
            ChatState::AddingChannelNeedName => {
                if text.is_empty() || text.len() > MAX_CHANNEL_NAME_LEN {
                    self.reply(
                        key,
                        format!("Channel names are 1 to {MAX_CHANNEL_NAME_LEN} characters."),
                    )
                    .await;
                    return Ok(());
                }
                self.sessions.set_chat_state(
                    key,
                    ChatState::AddingChannelNeedKey {
                        name: text.to_string(),
                    },
                );
                self.reply(
                    key,
                    "Send the channel key as hex, or a number 1-10 for a default key.",
                )
                .await;
                Ok(())
            }
            ChatState::AddingChannelNeedKey { name } => {
                self.begin_add_channel(key, &name, text).await
            }
            ChatState::RemovingDevice => self.remove_device(key, text, false).await,
            ChatState::RemovingDeviceFromAll => self.remove_device(key, text, true).await,
            ChatState::Admin => self.register_gateway(key, text).await,
        }
    }

    async fn begin_add_device(&self, key: ChatKey, input: &str) -> anyhow::Result<()> {
        let Some(device_id) = parse_node_id(input) else {
            self.sessions.set_chat_state(key, ChatState::AddingDeviceNeedId);
            self.reply(key, "That is not a node id. Try again or /cancel.").await;
            return Ok(());
        };
        let Some(device) = self.sessions.get_device(device_id).await? else {
            self.sessions.set_chat_state(key, ChatState::Default);
            self.reply(
                key,
                format!(
                    "{} has not announced itself on the mesh yet. Send node info from the device and try again.",
                    format_node_id(device_id)
                ),
            )
            .await;
            return Ok(());
        };

        let code = self.sessions.issue_code(key, device_id, None);
        let wait = self.outbox.send_direct(
            &device,
            &format!("Meshlink code: {code}"),
            Priority::High,
        )?;
        self.sessions.set_chat_state(key, ChatState::AddingDeviceNeedCode);
        self.reply(
            key,
            format!(
                "A code was sent to {} and should arrive {}. Reply with it here.",
                format_node_id(device_id),
                describe_wait(wait)
            ),
        )
        .await;
        Ok(())
    }

    async fn begin_add_channel(&self, key: ChatKey, name: &str, input: &str) -> anyhow::Result<()> {
        let Some(psk) = parse_channel_key(input) else {
            self.reply(key, "That key is not valid. Try again or /cancel.").await;
            return Ok(());
        };
        let storage = self.sessions.storage();
        let links = storage.devices_for_chat(key.chat_id).await?;
        let Some(link) = links.iter().find(|l| l.owner_user_id == key.user_id) else {
            self.sessions.set_chat_state(key, ChatState::Default);
            self.reply(key, "Link your own device with /add_device before adding a channel.")
                .await;
            return Ok(());
        };

        // Nothing is stored until the code comes back
        let channel = PendingChannel {
            name: name.to_string(),
            key: psk,
        };
        let code = self
            .sessions
            .issue_code(key, link.device_id, Some(channel.clone()));
        let wait = self.outbox.send_pending_channel(
            &channel,
            &format!("Meshlink code: {code}"),
            Priority::High,
        )?;
        self.sessions.set_chat_state(key, ChatState::AddingChannelNeedCode);
        self.reply(
            key,
            format!(
                "A code was broadcast on {} and should arrive {}. Reply with it here.",
                channel.name,
                describe_wait(wait)
            ),
        )
        .await;
        Ok(())
    }

    async fn verify_code(&self, key: ChatKey, input: &str) -> anyhow::Result<()> {
        match self.sessions.try_verify_code(key, input).await? {
            CodeVerification::Verified {
                device_id,
                channel,
                change,
            } => {
                self.sessions.set_chat_state(key, ChatState::Default);
                match channel {
                    Some(pending) => {
                        let storage = self.sessions.storage();
                        let hash = channel_hash(&pending.name, &pending.key)?;
                        let record = storage
                            .upsert_channel(&pending.name, &pending.key, hash, false)
                            .await?;
                        storage.upsert_channel_link(key.chat_id, record.id).await?;
                        self.reply(key, format!("Channel {} linked to this chat.", record.name))
                            .await;
                    }
                    None => {
                        let text = match change {
                            LinkChange::Inserted => {
                                format!("{} linked to this chat.", format_node_id(device_id))
                            }
                            LinkChange::Updated => {
                                format!("{} was already linked.", format_node_id(device_id))
                            }
                        };
                        self.reply(key, text).await;
                    }
                }
            }
            CodeVerification::Mismatch { remaining } if remaining > 0 => {
                self.reply(key, format!("Wrong code, {remaining} attempts left."))
                    .await;
            }
            CodeVerification::Mismatch { .. } | CodeVerification::TooManyAttempts => {
                self.sessions.set_chat_state(key, ChatState::Default);
                self.reply(key, "Too many wrong attempts. Start over.").await;
            }
            CodeVerification::Expired => {
                self.sessions.set_chat_state(key, ChatState::Default);
                self.sessions.clear_pending_code(key);
                self.reply(key, "The code has expired. Start over.").await;
            }
            CodeVerification::NotFound => {
                self.sessions.set_chat_state(key, ChatState::Default);
                self.reply(key, "No code is pending. Start over.").await;
            }
        }
        Ok(())
    }

    async fn remove_device(&self, key: ChatKey, input: &str, everywhere: bool) -> anyhow::Result<()> {
        let Some(device_id) = parse_node_id(input) else {
            self.reply(key, "That is not a node id. Try again or /cancel.").await;
            return Ok(());
        };
        self.sessions.set_chat_state(key, ChatState::Default);

        let storage = self.sessions.storage();
        let links = storage.devices_for_chat(key.chat_id).await?;
        let Some(link) = links.iter().find(|l| l.device_id == device_id) else {
            self.reply(
                key,
                format!("{} is not linked to this chat.", format_node_id(device_id)),
            )
            .await;
            return Ok(());
        };

        if everywhere {
            if link.owner_user_id != key.user_id {
                self.reply(key, "Only the user who linked the device can remove it everywhere.")
                    .await;
                return Ok(());
            }
            let removed = storage.remove_device_from_all(device_id).await?;
            self.sessions.invalidate_device(device_id);
            self.reply(
                key,
                format!("{} unlinked from {removed} chats.", format_node_id(device_id)),
            )
            .await;
        } else {
            storage.remove_device_link(key.chat_id, device_id).await?;
            self.reply(key, format!("{} unlinked.", format_node_id(device_id)))
                .await;
        }
        Ok(())
    }

    async fn register_gateway(&self, key: ChatKey, input: &str) -> anyhow::Result<()> {
        let Some(node) = parse_node_id(input) else {
            self.reply(key, "That is not a node id. Try again or /cancel.").await;
            return Ok(());
        };
        self.sessions.set_chat_state(key, ChatState::Default);

        let gateway_id = format_node_id(node);
        let storage = self.sessions.storage();
        if let Some(existing) = storage.get_gateway(&gateway_id).await? {
            if existing.owner_user_id != key.user_id {
                self.reply(key, format!("{gateway_id} is registered by another user."))
                    .await;
                return Ok(());
            }
        }
        storage
            .upsert_gateway(&GatewayRecord {
                gateway_id: gateway_id.clone(),
                owner_user_id: key.user_id,
                last_seen: Utc::now(),
            })
            .await?;
        self.reply(key, format!("Gateway {gateway_id} registered.")).await;
        Ok(())
    }

    async fn list_devices(&self, key: ChatKey) -> anyhow::Result<()> {
        let links = self.sessions.storage().devices_for_chat(key.chat_id).await?;
        if links.is_empty() {
            self.reply(key, "No devices linked. Use /add_device.").await;
            return Ok(());
        }
        let mut lines = Vec::with_capacity(links.len());
        for link in &links {
            let name = self
                .sessions
                .get_device(link.device_id)
                .await?
                .and_then(|d| d.name)
                .unwrap_or_default();
            lines.push(format!("{} {}", format_node_id(link.device_id), name).trim_end().to_string());
        }
        self.reply(key, lines.join("\n")).await;
        Ok(())
    }

    async fn relay_to_devices(&self, key: ChatKey, user: &ChatUser, text: &str) -> anyhow::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let links = self.sessions.storage().devices_for_chat(key.chat_id).await?;
        if links.is_empty() {
            self.reply(key, "No devices linked. Use /add_device.").await;
            return Ok(());
        }

        let body = format!("{}: {}", user.display_name(), text);
        let mut longest = Duration::ZERO;
        for link in &links {
            match self.sessions.get_device(link.device_id).await? {
                Some(device) => {
                    let wait = self.outbox.send_direct(&device, &body, Priority::Normal)?;
                    longest = longest.max(wait);
                }
                None => warn!(device = link.device_id, "Linked device has no record"),
            }
        }
        if longest >= SLOW_RELAY_NOTICE {
            self.reply(key, format!("Queued, delivery {}.", describe_wait(longest)))
                .await;
        }
        Ok(())
    }

    async fn reply(&self, key: ChatKey, text: impl AsRef<str>) {
        if let Err(e) = self.notifier.send_text(key.chat_id, text.as_ref()).await {
            warn!(chat = key.chat_id, "Chat reply failed: {}", e);
        }
    }
}

#[async_trait]
impl MessageHandler for ChatRouter {
    async fn handle(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        let update: Update = serde_json::from_slice(&payload)?;
        debug!(topic = %topic, update_id = update.update_id, "Chat update");
        self.on_update(update).await
    }
}

/// Parse a channel key: hex for 16/32 byte keys, 0-10 for the default key family
pub fn parse_channel_key(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    if input.len() <= 2 {
        let index = input.parse::<u8>().ok()?;
        return (index <= 10).then(|| vec![index]);
    }
    let bytes = hex::decode(input).ok()?;
    matches!(bytes.len(), 16 | 32).then_some(bytes)
}

fn describe_wait(wait: Duration) -> String {
    if wait < Duration::from_secs(1) {
        "shortly".to_string()
    } else {
        format!("in about {}s", wait.as_secs())
    }
}
