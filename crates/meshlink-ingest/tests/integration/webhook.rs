//! Webhook republishing

use axum::http::StatusCode;
use bytes::Bytes;

use super::common::*;

const UPDATE: &str = r#"{"update_id":7,"message":{"message_id":1,"chat":{"id":-5},"text":"hi"}}"#;

#[tokio::test(start_paused = true)]
async fn test_update_republished() {
    let h = Harness::new(None);
    let response = h.call(webhook(UPDATE, None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let published = h.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "chat/updates");
    assert_eq!(published[0].payload, Bytes::from(UPDATE));
    assert!(!published[0].retain);
}

#[tokio::test(start_paused = true)]
async fn test_secret_checked() {
    let h = Harness::new(Some(SECRET));

    let response = h.call(webhook(UPDATE, None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = h.call(webhook(UPDATE, Some("wrong"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = h.call(webhook(UPDATE, Some(&SECRET[..SECRET.len() - 1]))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(h.broker.published().is_empty());

    let response = h.call(webhook(UPDATE, Some(SECRET))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_and_invalid_bodies_rejected() {
    let h = Harness::new(None);
    let response = h.call(webhook("", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = h.call(webhook("{not json", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broker_outage_buffers() {
    let h = Harness::new(None);
    h.broker.set_online(false);

    let response = h.call(webhook(UPDATE, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.state.link.pending_len(), 1);

    h.broker.set_online(true);
    let next = r#"{"update_id":8}"#;
    let response = h.call(webhook(next, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.broker.published_payloads(),
        vec![Bytes::from(UPDATE), Bytes::from(next)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish_after_shutdown_fails() {
    let h = Harness::new(None);
    h.state.link.shutdown().await;

    let response = h.call(webhook(UPDATE, None)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
