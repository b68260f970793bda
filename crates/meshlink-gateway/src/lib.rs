//! Meshlink gateway - chat to mesh bridge
//!
//! Subscribes to chat updates and mesh traffic on the broker and:
//! - drives device/channel registration conversations ([`router`])
//! - relays chat text to linked devices through the paced dispatcher ([`outbox`])
//! - relays fresh mesh text to linked chats ([`mesh`])
//! - announces a retained status payload ([`status`])

#![warn(missing_docs)]

pub mod app;
pub mod chat;
pub mod mesh;
pub mod notifier;
pub mod outbox;
pub mod router;
pub mod status;

pub use app::Gateway;
pub use chat::{Command, Update};
pub use mesh::{MeshRouter, MeshStats};
pub use notifier::{ChatNotifier, LogNotifier};
pub use outbox::MeshOutbox;
pub use router::ChatRouter;
pub use status::{GatewayTracker, StatusAnnouncer};

/// Gateway version reported in status announcements
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
