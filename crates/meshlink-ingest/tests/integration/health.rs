//! Status and health endpoints

use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use meshlink_core::{GatewaySeen, GatewayStatus, QueueDepths};
use serde_json::Value;
use std::time::Duration;

use super::common::*;

fn status_payload(minutes_old: i64, gateways: Vec<GatewaySeen>) -> Bytes {
    let status = GatewayStatus {
        gateway_id: "!0000beef".to_string(),
        last_seen: Utc::now() - ChronoDuration::minutes(minutes_old),
        version: "0.1.0".to_string(),
        queues: QueueDepths::default(),
        gateways,
    };
    Bytes::from(status.to_json().unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_starting_within_grace() {
    let h = Harness::new(None);
    let response = h.call(get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "starting");

    tokio::time::advance(h.config.health.grace + Duration::from_secs(1)).await;
    let response = h.call(get("/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(start_paused = true)]
async fn test_status_from_broker() {
    let h = Harness::new(None);
    h.state.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.broker.subscriptions().contains(&"meshlink/status".to_string()));

    let gateways = vec![
        GatewaySeen {
            gateway_id: "!00000002".to_string(),
            last_seen: Utc::now() - ChronoDuration::minutes(3),
        },
        GatewaySeen {
            gateway_id: "!00000003".to_string(),
            last_seen: Utc::now() - ChronoDuration::minutes(120),
        },
    ];
    assert!(h.broker.inject("meshlink/status", status_payload(1, gateways)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = h.call(get("/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["state"], "ok");
    assert_eq!(body["mode"], "all");
    assert_eq!(body["gateways"][0]["online"], true);
    assert_eq!(body["gateways"][1]["online"], false);

    h.state.link.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_status_unhealthy() {
    let h = Harness::new(None);
    h.state.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.broker.inject("meshlink/status", status_payload(30, Vec::new()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = h.call(get("/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "no recent updates");

    h.state.link.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_status_ignored() {
    let h = Harness::new(None);
    h.state.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.broker.inject("meshlink/status", Bytes::from_static(b"not json"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.state.status.latest().is_none());
    let response = h.call(get("/health")).await;
    assert_eq!(body_text(response).await, "starting");

    h.state.link.shutdown().await;
}
