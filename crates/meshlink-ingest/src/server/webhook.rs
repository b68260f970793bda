//! Chat platform webhook receiver

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use meshlink_core::PublishOutcome;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use crate::AppState;

/// Header carrying the shared webhook secret
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Republish one update onto the chat topic
///
/// The body is forwarded untouched once it parses as JSON. A broker outage
/// does not fail the request: the link buffers the publish and flushes it
/// after reconnecting.
pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(expected) = &state.webhook_secret {
        let provided = headers
            .get(SECRET_HEADER)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !secret_matches(provided, expected) {
            warn!("Webhook call with missing or wrong secret");
            return StatusCode::UNAUTHORIZED;
        }
    }

    if body.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
        debug!("Webhook body is not JSON: {}", e);
        return StatusCode::BAD_REQUEST;
    }

    match state.link.publish(&state.chat_topic, body).await {
        Ok(PublishOutcome::Sent) => StatusCode::OK,
        Ok(PublishOutcome::Buffered) => {
            debug!(pending = state.link.pending_len(), "Update buffered for the broker");
            StatusCode::OK
        }
        Err(e) => {
            error!("Failed to republish update: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Compare the provided secret without leaking the matching prefix length
fn secret_matches(provided: &[u8], expected: &str) -> bool {
    provided.ct_eq(expected.as_bytes()).into()
}
