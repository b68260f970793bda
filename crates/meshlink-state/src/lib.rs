//! Meshlink State - Persistent registration storage
//!
//! SQLite-backed implementation of
//! [`RegistrationStorage`](meshlink_core::RegistrationStorage) for devices,
//! channels, their chat links and gateway registrations.
//!
//! ## Example
//!
//! ```ignore
//! use meshlink_core::{SessionConfig, SessionStore};
//! use meshlink_state::SqliteStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::new("meshlink.db").await?;
//!     let sessions = SessionStore::new(SessionConfig::default(), Arc::new(store));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;

pub use error::{Result, StateError};
pub use storage::SqliteStore;
