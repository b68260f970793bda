//! Replies into chat

use async_trait::async_trait;
use tracing::info;

/// Delivers text into a chat
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    /// Send `text` to `chat_id`
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// Notifier that writes replies to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ChatNotifier for LogNotifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        info!(chat = chat_id, text = %text, "Chat reply");
        Ok(())
    }
}
