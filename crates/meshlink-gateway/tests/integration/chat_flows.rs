//! Registration conversations and chat-to-mesh relay

use meshlink_core::{ChatState, RegistrationStorage};
use std::time::Duration;

use super::common::*;

// ============ Adding a device ============

#[tokio::test(start_paused = true)]
async fn test_add_device_with_code() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;

    h.chat(USER, CHAT, "/add_device !0000abcd").await;
    assert!(h.notifier.last(CHAT).contains("code was sent to !0000abcd"));
    assert_eq!(
        h.gateway.sessions().chat_state(key()),
        ChatState::AddingDeviceNeedCode
    );
    assert_eq!(h.gateway.dispatcher().queue_lens().high, 1);

    h.chat(USER, CHAT, "not-the-code").await;
    assert_eq!(h.notifier.last(CHAT), "Wrong code, 4 attempts left.");

    let code = h.gateway.sessions().pending_code(key()).unwrap().code;
    h.chat(USER, CHAT, &code).await;
    assert_eq!(h.notifier.last(CHAT), "!0000abcd linked to this chat.");
    assert_eq!(h.storage.device_link_count(), 1);
    assert_eq!(h.gateway.sessions().chat_state(key()), ChatState::Default);
    assert!(h.gateway.sessions().pending_code(key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_add_device_asks_for_id() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;

    h.chat(USER, CHAT, "/add_device").await;
    assert_eq!(
        h.gateway.sessions().chat_state(key()),
        ChatState::AddingDeviceNeedId
    );

    h.chat(USER, CHAT, "base station").await;
    assert!(h.notifier.last(CHAT).contains("not a node id"));
    assert_eq!(
        h.gateway.sessions().chat_state(key()),
        ChatState::AddingDeviceNeedId
    );

    h.chat(USER, CHAT, "0xabcd").await;
    assert_eq!(
        h.gateway.sessions().chat_state(key()),
        ChatState::AddingDeviceNeedCode
    );
}

#[tokio::test(start_paused = true)]
async fn test_add_unknown_device() {
    let h = Harness::new();
    h.chat(USER, CHAT, "/add_device !00001234").await;
    assert!(h.notifier.last(CHAT).contains("has not announced itself"));
    assert_eq!(h.gateway.sessions().chat_state(key()), ChatState::Default);
    assert_eq!(h.gateway.dispatcher().queue_lens().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_codes_exhaust() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.chat(USER, CHAT, "/add_device !0000abcd").await;

    for _ in 0..4 {
        h.chat(USER, CHAT, "000000x").await;
    }
    assert_eq!(h.notifier.last(CHAT), "Wrong code, 1 attempts left.");
    h.chat(USER, CHAT, "000000x").await;
    assert_eq!(h.notifier.last(CHAT), "Too many wrong attempts. Start over.");
    assert_eq!(h.gateway.sessions().chat_state(key()), ChatState::Default);
    assert_eq!(h.storage.device_link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_code() {
    let mut config = config();
    config.session.code_ttl = Duration::from_secs(60);
    let h = Harness::with_config(config);
    h.known_device(DEVICE, "Base").await;
    h.chat(USER, CHAT, "/add_device !0000abcd").await;
    let code = h.gateway.sessions().pending_code(key()).unwrap().code;

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    h.chat(USER, CHAT, &code).await;
    assert_eq!(h.notifier.last(CHAT), "The code has expired. Start over.");
    assert_eq!(h.storage.device_link_count(), 0);
    assert!(h.gateway.sessions().pending_code(key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_clears_code() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.chat(USER, CHAT, "/add_device !0000abcd").await;

    h.chat(USER, CHAT, "/cancel").await;
    assert_eq!(h.notifier.last(CHAT), "Cancelled.");
    assert!(h.gateway.sessions().pending_code(key()).is_none());
    assert_eq!(h.gateway.sessions().chat_state(key()), ChatState::Default);
}

// ============ Channels ============

#[tokio::test(start_paused = true)]
async fn test_add_channel_flow() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();

    h.chat(USER, CHAT, "/add_channel").await;
    h.chat(USER, CHAT, "LongFast").await;
    assert_eq!(
        h.gateway.sessions().chat_state(key()),
        ChatState::AddingChannelNeedKey {
            name: "LongFast".to_string()
        }
    );

    h.chat(USER, CHAT, "1").await;
    assert!(h.notifier.last(CHAT).contains("broadcast on LongFast"));
    let pending = h.gateway.sessions().pending_code(key()).unwrap();
    assert_eq!(pending.device_id, DEVICE);
    assert_eq!(pending.channel.as_ref().unwrap().key, vec![1]);

    h.chat(USER, CHAT, &pending.code).await;
    assert_eq!(h.notifier.last(CHAT), "Channel LongFast linked to this chat.");
    let channels = h.storage.channels_by_hash(8).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(
        h.storage.chats_for_channel(channels[0].id).await.unwrap(),
        vec![CHAT]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_channel_is_not_stored() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();

    for _ in 0..3 {
        h.chat(USER, CHAT, "/add_channel").await;
        h.chat(USER, CHAT, "LongFast").await;
        h.chat(USER, CHAT, "1").await;
        assert!(h.notifier.last(CHAT).contains("broadcast on LongFast"));
        h.chat(USER, CHAT, "/cancel").await;
        assert_eq!(h.notifier.last(CHAT), "Cancelled.");
    }

    assert!(h.storage.channels_by_hash(8).await.unwrap().is_empty());
    assert!(h.gateway.sessions().pending_code(key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_add_channel_requires_own_device() {
    let h = Harness::new();
    h.chat(USER, CHAT, "/add_channel").await;
    h.chat(USER, CHAT, "this name is far too long").await;
    assert!(h.notifier.last(CHAT).contains("1 to 11 characters"));

    h.chat(USER, CHAT, "Test").await;
    h.chat(USER, CHAT, &"00".repeat(16)).await;
    assert!(h.notifier.last(CHAT).contains("Link your own device"));
    assert_eq!(h.gateway.sessions().chat_state(key()), ChatState::Default);
}

// ============ Removing devices ============

#[tokio::test(start_paused = true)]
async fn test_remove_device_from_chat() {
    let h = Harness::new();
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();
    h.storage.upsert_device_link(CHAT + 1, DEVICE, USER).await.unwrap();

    h.chat(USER, CHAT, "/remove_device").await;
    h.chat(USER, CHAT, "!0000abcd").await;
    assert_eq!(h.notifier.last(CHAT), "!0000abcd unlinked.");
    assert_eq!(h.storage.chats_for_device(DEVICE).await.unwrap(), vec![CHAT + 1]);

    h.chat(USER, CHAT, "/remove_device !0000abcd").await;
    assert!(h.notifier.last(CHAT).contains("is not linked"));
}

#[tokio::test(start_paused = true)]
async fn test_remove_everywhere_needs_owner() {
    let h = Harness::new();
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();
    h.storage.upsert_device_link(CHAT + 1, DEVICE, USER).await.unwrap();

    h.chat(USER + 1, CHAT, "/remove_device_all !0000abcd").await;
    assert!(h.notifier.last(CHAT).contains("Only the user who linked"));
    assert_eq!(h.storage.device_link_count(), 2);

    h.chat(USER, CHAT, "/remove_device_all !0000abcd").await;
    assert_eq!(h.notifier.last(CHAT), "!0000abcd unlinked from 2 chats.");
    assert_eq!(h.storage.device_link_count(), 0);
}

// ============ Other commands ============

#[tokio::test(start_paused = true)]
async fn test_devices_and_unknown_command() {
    let h = Harness::new();
    h.chat(USER, CHAT, "/devices").await;
    assert_eq!(h.notifier.last(CHAT), "No devices linked. Use /add_device.");

    h.known_device(DEVICE, "Base").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();
    h.chat(USER, CHAT, "/devices").await;
    assert_eq!(h.notifier.last(CHAT), "!0000abcd Base");

    h.chat(USER, CHAT, "/launch").await;
    assert!(h.notifier.last(CHAT).starts_with("Unknown command /launch"));
}

#[tokio::test(start_paused = true)]
async fn test_register_gateway() {
    let h = Harness::new();
    h.chat(USER, CHAT, "/add_gateway").await;
    assert_eq!(h.gateway.sessions().chat_state(key()), ChatState::Admin);
    h.chat(USER, CHAT, "!a1b2c3d4").await;
    assert_eq!(h.notifier.last(CHAT), "Gateway !a1b2c3d4 registered.");

    h.chat(USER + 1, CHAT, "/add_gateway !a1b2c3d4").await;
    assert!(h.notifier.last(CHAT).contains("registered by another user"));
    let record = h.storage.get_gateway("!a1b2c3d4").await.unwrap().unwrap();
    assert_eq!(record.owner_user_id, USER);
}

// ============ Relay ============

#[tokio::test(start_paused = true)]
async fn test_text_relayed_to_linked_devices() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.known_device(DEVICE + 1, "Rover").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();
    h.storage.upsert_device_link(CHAT, DEVICE + 1, USER).await.unwrap();
    h.gateway.start().unwrap();

    h.chat(USER, CHAT, "on my way").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let packets = h.mesh_published();
    assert_eq!(packets.len(), 2);
    let mut targets: Vec<u32> = packets.iter().map(|p| p.to).collect();
    targets.sort();
    assert_eq!(targets, vec![DEVICE, DEVICE + 1]);
    for packet in &packets {
        assert_eq!(packet.from, GATEWAY_NODE);
        assert!(packet.pki_encrypted);
        assert!(packet.want_ack);
        assert_eq!(packet_text(packet), "Ana: on my way");
    }

    h.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_relay_without_devices_hints() {
    let h = Harness::new();
    h.chat(USER, CHAT, "hello?").await;
    assert_eq!(h.notifier.last(CHAT), "No devices linked. Use /add_device.");
}

#[tokio::test(start_paused = true)]
async fn test_codes_jump_the_relay_queue() {
    let h = Harness::new();
    h.known_device(DEVICE, "Base").await;
    h.storage.upsert_device_link(CHAT, DEVICE, USER).await.unwrap();

    h.chat(USER, CHAT, "first").await;
    h.chat(USER, CHAT, "second").await;
    h.chat(USER + 1, CHAT + 5, "/add_device !0000abcd").await;
    h.gateway.start().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let texts: Vec<String> = h.mesh_published().iter().map(packet_text).collect();
    assert_eq!(texts.len(), 3);
    assert!(texts[0].starts_with("Meshlink code: "));
    assert_eq!(texts[1], "Ana: first");
    assert_eq!(texts[2], "Ana: second");

    h.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_chat_update_through_broker() {
    let h = Harness::new();
    h.gateway.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.gateway.link().is_connected());

    h.broker.inject("chat/updates", update(USER, CHAT, "/start"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.notifier.last(CHAT).starts_with("Commands:"));

    // Malformed updates are logged and dropped
    h.broker
        .inject("chat/updates", bytes::Bytes::from_static(b"{not json"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.notifier.replies(CHAT).len(), 1);

    h.gateway.shutdown().await;
}
