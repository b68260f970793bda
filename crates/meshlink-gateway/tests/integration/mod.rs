//! Gateway integration tests
//!
//! The gateway runs against the in-process mock broker and in-memory
//! storage; chat replies are captured by a recording notifier.

mod chat_flows;
mod common;
mod mesh_inbound;
mod status;
