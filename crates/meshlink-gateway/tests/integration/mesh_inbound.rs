//! Mesh envelopes arriving from the broker

use bytes::Bytes;
use meshlink_core::{
    channel_hash, Data, MeshPacket, MessageHandler, PacketCodec, PlaintextCodec, PortNum,
    Recipient, RegistrationStorage, ServiceEnvelope, User, BROADCAST_ADDR,
};
use prost::Message;

use super::common::*;

fn node_info(long_name: &str, key: Vec<u8>) -> Data {
    let user = User {
        id: "!0000abcd".to_string(),
        long_name: long_name.to_string(),
        short_name: "BASE".to_string(),
        public_key: key,
    };
    Data {
        portnum: PortNum::NodeinfoApp as i32,
        payload: user.encode_to_vec(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_node_info_registers_device() {
    let h = Harness::new();
    let envelope = plain_envelope(DEVICE, BROADCAST_ADDR, 10, node_info("Base", vec![9; 32]), "!00000002");
    h.envelope(&envelope).await.unwrap();

    let device = h.storage.get_device(DEVICE).await.unwrap().unwrap();
    assert_eq!(device.name.as_deref(), Some("Base"));
    assert_eq!(device.public_key, vec![9; 32]);
    assert_eq!(h.gateway.mesh_router().stats().nodeinfo_updates, 1);

    // A short key renames but keeps the stored key
    let envelope = plain_envelope(DEVICE, BROADCAST_ADDR, 11, node_info("Roof", vec![1; 4]), "!00000002");
    h.envelope(&envelope).await.unwrap();
    let device = h.storage.get_device(DEVICE).await.unwrap().unwrap();
    assert_eq!(device.name.as_deref(), Some("Roof"));
    assert_eq!(device.public_key, vec![9; 32]);
}

#[tokio::test(start_paused = true)]
async fn test_node_info_without_key_is_ignored() {
    let h = Harness::new();
    let envelope = plain_envelope(DEVICE, BROADCAST_ADDR, 12, node_info("Base", Vec::new()), "!00000002");
    h.envelope(&envelope).await.unwrap();
    assert!(h.storage.get_device(DEVICE).await.unwrap().is_none());
}

// ============ Text relay ============

#[tokio::test(start_paused = true)]
async fn test_text_relayed_to_linked_chats() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();

    let envelope = plain_envelope(DEVICE, GATEWAY_NODE, 20, Data::text("all good here"), "!00000002");
    h.envelope(&envelope).await.unwrap();

    assert_eq!(h.notifier.last(CHAT), "Base: all good here");
    assert_eq!(h.gateway.mesh_router().stats().relayed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_from_second_gateway_relayed_once() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();

    let first = plain_envelope(DEVICE, GATEWAY_NODE, 21, Data::text("ping"), "!00000002");
    let mut second = first.clone();
    second.gateway_id = "!00000003".to_string();

    h.envelope(&first).await.unwrap();
    h.envelope(&second).await.unwrap();

    assert_eq!(h.notifier.replies(CHAT), vec!["Base: ping".to_string()]);
    let stats = h.gateway.mesh_router().stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.duplicates, 1);
    assert!(h.gateway.tracker().last_seen("!00000002").is_some());
    assert!(h.gateway.tracker().last_seen("!00000003").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_own_packets_ignored() {
    let h = Harness::new();
    h.storage.upsert_device_link(CHAT, GATEWAY_NODE, USER).await.unwrap();

    let envelope = plain_envelope(GATEWAY_NODE, DEVICE, 22, Data::text("echo"), GATEWAY_ID);
    h.envelope(&envelope).await.unwrap();

    assert!(h.notifier.replies(CHAT).is_empty());
    assert_eq!(h.gateway.mesh_router().stats().duplicates, 0);
    assert_eq!(h.gateway.tracker().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_text_reaches_channel_chats() {
    let h = Harness::new();
    let hash = channel_hash("LongFast", &[1]).unwrap();
    let channel = h
        .storage
        .upsert_channel("LongFast", &[1], hash, false)
        .await
        .unwrap();
    h.storage.upsert_channel_link(CHAT, channel.id).await.unwrap();

    let recipient = Recipient::Channel {
        id: channel.id,
        xor: hash,
        key: vec![1],
    };
    let mut packet = MeshPacket::outgoing(0x1234_5678, BROADCAST_ADDR, Data::text("net check"), false, 3);
    packet.id = 30;
    let packet = PlaintextCodec.encrypt(packet, &recipient).unwrap();
    assert_eq!(packet.channel, 8);

    let envelope = ServiceEnvelope {
        packet: Some(packet),
        channel_id: "LongFast".to_string(),
        gateway_id: "!00000002".to_string(),
    };
    h.envelope(&envelope).await.unwrap();

    assert_eq!(h.notifier.last(CHAT), "!12345678: net check");
}

// ============ Rejections ============

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_rejected() {
    let h = Harness::new();
    let result = h
        .gateway
        .mesh_router()
        .handle("msh/test", Bytes::from_static(&[0xff, 0xff, 0xff]))
        .await;
    assert!(result.is_err());

    let empty = ServiceEnvelope {
        packet: None,
        channel_id: "LongFast".to_string(),
        gateway_id: "!00000002".to_string(),
    };
    assert!(h.envelope(&empty).await.is_err());
    assert_eq!(h.gateway.mesh_router().stats().received, 0);
}

#[tokio::test(start_paused = true)]
async fn test_direct_packet_to_unknown_device_undecodable() {
    let h = Harness::new();
    let recipient = Recipient::Device {
        id: 0x0000_5555,
        key: vec![3; 32],
    };
    let mut packet = MeshPacket::outgoing(DEVICE, 0x0000_5555, Data::text("secret"), true, 3);
    packet.id = 40;
    let packet = PlaintextCodec.encrypt(packet, &recipient).unwrap();
    let envelope = ServiceEnvelope {
        packet: Some(packet),
        channel_id: "PKI".to_string(),
        gateway_id: "!00000002".to_string(),
    };

    h.envelope(&envelope).await.unwrap();
    let stats = h.gateway.mesh_router().stats();
    assert_eq!(stats.undecodable, 1);
    assert_eq!(stats.relayed, 0);
}
