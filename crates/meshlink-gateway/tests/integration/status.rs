//! Retained status announcements

use chrono::{Duration as ChronoDuration, Utc};
use meshlink_core::{Data, GatewayRecord, GatewayStatus, RegistrationStorage};
use std::time::Duration;

use super::common::*;

#[tokio::test(start_paused = true)]
async fn test_snapshot_persists_tracked_last_seen() {
    let h = Harness::new();
    let stale = Utc::now() - ChronoDuration::hours(3);
    h.storage
        .upsert_gateway(&GatewayRecord {
            gateway_id: "!00000002".to_string(),
            owner_user_id: USER,
            last_seen: stale,
        })
        .await
        .unwrap();

    let status = h.gateway.announcer().snapshot().await.unwrap();
    assert_eq!(status.gateways.len(), 1);
    assert_eq!(status.gateways[0].last_seen, stale);

    let envelope = plain_envelope(DEVICE, GATEWAY_NODE, 50, Data::text("hi"), "!00000002");
    h.envelope(&envelope).await.unwrap();

    let status = h.gateway.announcer().snapshot().await.unwrap();
    assert_eq!(status.gateway_id, GATEWAY_ID);
    assert!(status.gateways[0].last_seen > stale);
    let stored = h.storage.get_gateway("!00000002").await.unwrap().unwrap();
    assert_eq!(stored.last_seen, status.gateways[0].last_seen);
    assert_eq!(status.monitored().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_publishes_retained_status() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.chat(USER, CHAT, "/add_device !0000abcd").await;

    h.gateway.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let published = h.broker.published();
    let status = published
        .iter()
        .find(|m| m.topic == "meshlink/status")
        .expect("status published");
    assert!(status.retain);

    let parsed = GatewayStatus::from_json(&status.payload).unwrap();
    assert_eq!(parsed.gateway_id, GATEWAY_ID);
    assert_eq!(parsed.version, meshlink_gateway::VERSION);
    assert!(parsed.gateways.is_empty());
    assert_eq!(parsed.monitored()[0].gateway_id, GATEWAY_ID);

    h.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_broker_retried_on_one_schedule() {
    let h = Harness::new();
    h.gateway.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.gateway.link().is_connected());
    assert_eq!(h.gateway.link().stats().connect_attempts, 1);

    h.broker.set_online(false);
    h.broker.drop_connection("broker restarting");

    // Retries at 5s and 12s after the drop, nothing in between
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!h.gateway.link().is_connected());
    assert_eq!(h.gateway.link().stats().connect_attempts, 3);

    h.broker.set_online(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.gateway.link().is_connected());
    assert_eq!(h.gateway.link().stats().connect_attempts, 4);

    h.gateway.shutdown().await;
}
