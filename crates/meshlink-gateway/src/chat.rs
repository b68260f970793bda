//! Chat platform update types and command parsing

use serde::{Deserialize, Serialize};

/// One update forwarded by the ingest process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    /// Platform-assigned update sequence number
    pub update_id: i64,
    /// Present for new messages; other update kinds are ignored
    #[serde(default)]
    pub message: Option<ChatMessage>,
}

/// An incoming chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id within the chat
    pub message_id: i64,
    /// Chat the message was posted in
    pub chat: Chat,
    /// Sender; absent for channel posts
    #[serde(default)]
    pub from: Option<ChatUser>,
    /// Message text; absent for media
    #[serde(default)]
    pub text: Option<String>,
}

/// Chat a message belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// Chat id, negative for groups
    pub id: i64,
}

/// Sender of a chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUser {
    /// User id
    pub id: i64,
    /// First name as set by the user
    #[serde(default)]
    pub first_name: String,
    /// Public handle, if any
    #[serde(default)]
    pub username: Option<String>,
}

impl ChatUser {
    /// Name shown on the mesh for relayed text
    pub fn display_name(&self) -> &str {
        match &self.username {
            Some(username) if !username.is_empty() => username,
            _ => &self.first_name,
        }
    }
}

/// Bot commands understood by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start` and `/help`
    Start,
    /// `/add_device [node id]`
    AddDevice(Option<String>),
    /// `/add_channel`
    AddChannel,
    /// `/remove_device [node id]`
    RemoveDevice(Option<String>),
    /// `/remove_device_all [node id]`
    RemoveDeviceAll(Option<String>),
    /// `/add_gateway [gateway id]`
    AddGateway(Option<String>),
    /// `/devices`
    Devices,
    /// `/status`
    Status,
    /// `/cancel`
    Cancel,
    /// Any other command, by name
    Unknown(String),
}

impl Command {
    /// Parse `/name[@bot] [argument]`; `None` for plain text
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, argument) = match rest.split_once(char::is_whitespace) {
            Some((head, argument)) => (head, Some(argument.trim().to_string())),
            None => (rest, None),
        };
        let argument = argument.filter(|a| !a.is_empty());
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        Some(match name.as_str() {
            "start" | "help" => Command::Start,
            "add_device" => Command::AddDevice(argument),
            "add_channel" => Command::AddChannel,
            "remove_device" => Command::RemoveDevice(argument),
            "remove_device_all" => Command::RemoveDeviceAll(argument),
            "add_gateway" => Command::AddGateway(argument),
            "devices" => Command::Devices,
            "status" => Command::Status,
            "cancel" => Command::Cancel,
            _ => Command::Unknown(name),
        })
    }
}
