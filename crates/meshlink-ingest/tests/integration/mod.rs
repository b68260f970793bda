//! Ingest integration tests

mod common;
mod health;
mod webhook;
